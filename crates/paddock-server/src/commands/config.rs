//! `paddockd config`: print the effective configuration.

use paddock_common::config::PaddockConfig;

/// Writes `config` to stdout as pretty JSON.
///
/// # Errors
///
/// Returns an error if the configuration cannot be serialized.
pub fn execute(config: &PaddockConfig) -> anyhow::Result<()> {
    let json = serde_json::to_string_pretty(config)?;
    #[allow(clippy::print_stdout)]
    {
        println!("{json}");
    }
    Ok(())
}
