/// Final output name rendering.
///
/// Templates contain `${placeholder}` markers. Only the placeholders in
/// `RESOLVERS` are substituted; anything else is left verbatim.
use regex::Regex;
use std::sync::LazyLock;

static PLACEHOLDER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*)\}").unwrap());

/// Values available to an output-name template.
#[derive(Debug, Clone)]
pub struct TemplateVars {
    /// Formatted connect time.
    pub connected_at: String,
    /// Formatted disconnect time.
    pub disconnected_at: String,
    pub connection_id: String,
    pub display_name: Option<String>,
}

type Resolver = fn(&TemplateVars) -> String;

static RESOLVERS: &[(&str, Resolver)] = &[
    ("ct", |v| v.connected_at.clone()),
    ("dt", |v| v.disconnected_at.clone()),
    ("id", |v| v.connection_id.clone()),
    ("name", |v| match v.display_name.as_deref() {
        None | Some("") | Some("null") => String::new(),
        Some(name) => format!("({name})"),
    }),
];

fn resolve(name: &str, vars: &TemplateVars) -> Option<String> {
    RESOLVERS
        .iter()
        .find(|(key, _)| *key == name)
        .map(|(_, resolver)| resolver(vars))
}

/// Substitute the known placeholders in `template`.
///
/// Substituted values are trimmed and have path separators and characters
/// Windows rejects in file names replaced by `_`, so the result is always a
/// single file name component.
pub fn render_output_name(template: &str, vars: &TemplateVars) -> String {
    let name = PLACEHOLDER
        .replace_all(template, |caps: &regex::Captures| {
            let name = &caps[1];
            match resolve(name, vars) {
                Some(value) => sanitize(value.trim()),
                None => {
                    tracing::warn!(placeholder = name, "unknown placeholder in output template");
                    caps[0].to_string()
                }
            }
        })
        .into_owned();

    // "", "." and ".." would name the output directory or its parent.
    if name.chars().all(|c| c == '.') {
        return if name.is_empty() {
            "_".to_string()
        } else {
            name.replace('.', "_")
        };
    }
    name
}

const RESERVED: &[char] = &['/', '\\', ':', '*', '?', '"', '<', '>', '|'];

fn sanitize(value: &str) -> String {
    let value: String = value
        .chars()
        .map(|c| {
            if c.is_control() || RESERVED.contains(&c) {
                '_'
            } else {
                c
            }
        })
        .collect();
    match value.as_str() {
        "." | ".." => value.replace('.', "_"),
        _ => value,
    }
}
