use std::fmt::Write;

use uuid::Uuid;

use super::error::{Context, DateraResult};

/// Prefix of every backend resource the driver creates
pub const NAME_PREFIX: &str = "CSI";
/// Longest orchestrator name kept before the prefix is added
const MAX_NAME_LEN: usize = 58;

/// Generate a random identifier
#[must_use]
#[inline]
pub fn gen_id() -> String {
    Uuid::new_v4().to_string()
}

/// Map an orchestrator supplied name to a backend resource name.
/// An empty name gets a random one, long names are cut at `MAX_NAME_LEN` chars.
#[must_use]
#[inline]
pub fn gen_name(name: &str) -> String {
    let base = if name.is_empty() {
        gen_id()
    } else {
        name.chars().take(MAX_NAME_LEN).collect()
    };
    format!("{NAME_PREFIX}-{base}")
}

/// Host name of this node
#[inline]
pub fn get_hostname() -> DateraResult<String> {
    let host = nix::unistd::gethostname().add_context("failed to get host name")?;
    Ok(host.to_string_lossy().into_owned())
}

/// Format `anyhow::Error`
#[must_use]
#[inline]
pub fn format_anyhow_error(error: &anyhow::Error) -> String {
    let err_msg_vec = anyhow::Error::chain(error)
        .map(ToString::to_string)
        .collect::<Vec<_>>();
    let mut err_msg = String::new();
    let _ignore = write!(
        err_msg,
        "{}, root cause: {}",
        err_msg_vec.as_slice().join(", caused by: "),
        error.root_cause()
    );

    err_msg
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_gen_name() {
        assert_eq!(gen_name("pvc-1"), "CSI-pvc-1");

        let long = "x".repeat(80);
        let name = gen_name(&long);
        assert_eq!(name.len(), MAX_NAME_LEN + 4);
        assert!(name.starts_with("CSI-xxx"));

        let random = gen_name("");
        assert!(random.starts_with("CSI-"));
        assert!(Uuid::parse_str(random.trim_start_matches("CSI-")).is_ok());
    }

    #[test]
    fn test_format_anyhow_error() {
        let err = anyhow::anyhow!("root").context("outer");
        let msg = format_anyhow_error(&err);
        assert_eq!(msg, "outer, caused by: root, root cause: root");
    }
}
