use serde::Serialize;

/// Rendered, user-facing connection instructions for one environment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AccessInfo {
    /// The environment's IP on the cluster network, when known.
    pub ip: Option<String>,
    /// The access template with all placeholders resolved.
    pub access: String,
}

/// Substitute runtime values into an operator-authored access template.
///
/// `{{ip}}` becomes the discovered IP (or the literal `unknown`), and for
/// every `(internal, published)` port pair the token `{{<internal>}}`
/// becomes the published port. Unrecognized `{{...}}` tokens are left
/// untouched so a typo in a template stays visible to the operator.
pub fn render_access_info(
    template: &str,
    ip: Option<&str>,
    ports: &[(u16, u16)],
) -> AccessInfo {
    let mut access = template.replace("{{ip}}", ip.unwrap_or("unknown"));
    for (internal, published) in ports {
        access = access.replace(&format!("{{{{{internal}}}}}"), &published.to_string());
    }
    AccessInfo {
        ip: ip.map(String::from),
        access,
    }
}
