//! `${KEY}` substitution in compose templates.

use std::collections::BTreeMap;

/// Replace every `${KEY}` whose key is in `settings`. Unknown placeholders
/// and unterminated `${` are left as written.
pub fn render_compose(template: &str, settings: &BTreeMap<String, String>) -> String {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;

    while let Some(start) = rest.find("${") {
        out.push_str(&rest[..start]);
        let after = &rest[start + 2..];

        match after.find('}') {
            Some(end) => {
                let key = &after[..end];
                match settings.get(key) {
                    Some(value) => out.push_str(value),
                    None => out.push_str(&rest[start..start + 2 + end + 1]),
                }
                rest = &after[end + 1..];
            }
            None => {
                out.push_str(&rest[start..]);
                rest = "";
            }
        }
    }

    out.push_str(rest);
    out
}
