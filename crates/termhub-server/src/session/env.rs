//! Environment for spawned shells.
//!
//! Browser terminals render colour, so colour-aware tools are told so even
//! when the server itself runs with colour disabled.

/// Variables forced on every spawned shell, in order.
pub const FORCED_VARS: [(&str, &str); 5] = [
    ("TERM", "xterm-256color"),
    ("COLORTERM", "truecolor"),
    ("CLICOLOR", "1"),
    ("CLICOLOR_FORCE", "1"),
    ("FORCE_COLOR", "1"),
];

/// Build the shell environment from `ambient`.
///
/// Passes everything through except `NO_COLOR` and `CLICOLOR=0`, then appends
/// [`FORCED_VARS`]. Forced variables replace any ambient value of the same key.
pub fn color_env<I, K, V>(ambient: I) -> Vec<(String, String)>
where
    I: IntoIterator<Item = (K, V)>,
    K: Into<String>,
    V: Into<String>,
{
    let mut env: Vec<(String, String)> = ambient
        .into_iter()
        .map(|(k, v)| (k.into(), v.into()))
        .filter(|(k, v)| k != "NO_COLOR" && !(k == "CLICOLOR" && v == "0"))
        .filter(|(k, _)| !FORCED_VARS.iter().any(|(forced, _)| forced == k))
        .collect();
    env.extend(
        FORCED_VARS
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string())),
    );
    env
}

/// [`color_env`] applied to the server's own environment.
pub fn process_color_env() -> Vec<(String, String)> {
    color_env(std::env::vars_os().filter_map(|(k, v)| {
        Some((k.into_string().ok()?, v.into_string().ok()?))
    }))
}
