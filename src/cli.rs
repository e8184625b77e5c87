//! Command-line surface.
//!
//! The flag names follow the launch scripts the front-end ships with
//! (`-p`, `-c`, `-m`, `--https`, `--httpsKey`, ...). Kebab-case aliases are
//! accepted as well. Boolean flags take strtobool-style values
//! (`true/false`, `yes/no`, `on/off`, `1/0`); a bare `--https` means `true`.

use clap::builder::BoolishValueParser;
use clap::Parser;
use std::path::PathBuf;

#[derive(Debug, Clone, Parser)]
#[command(
    name = "voice-conversion-server",
    version,
    about = "Voice conversion over an event channel"
)]
pub struct Cli {
    /// Port to listen on
    #[arg(short = 'p', value_name = "PORT")]
    pub port: u16,

    /// Path to the model configuration (hyper-parameter JSON)
    #[arg(short = 'c', value_name = "CONFIG")]
    pub model_config: PathBuf,

    /// Path to the model checkpoint
    #[arg(short = 'm', value_name = "MODEL")]
    pub checkpoint: PathBuf,

    /// Serve over HTTPS
    #[arg(
        long = "https",
        value_name = "BOOL",
        value_parser = BoolishValueParser::new(),
        num_args = 0..=1,
        default_missing_value = "true"
    )]
    pub https: Option<bool>,

    /// Private key used when HTTPS is enabled without self-signing
    #[arg(long = "httpsKey", alias = "https-key", value_name = "PATH")]
    pub https_key: Option<PathBuf>,

    /// Certificate used when HTTPS is enabled without self-signing
    #[arg(long = "httpsCert", alias = "https-cert", value_name = "PATH")]
    pub https_cert: Option<PathBuf>,

    /// Generate a self-signed certificate when HTTPS is enabled
    #[arg(
        long = "httpsSelfSigned",
        alias = "https-self-signed",
        value_name = "BOOL",
        value_parser = BoolishValueParser::new(),
        num_args = 0..=1,
        default_missing_value = "true"
    )]
    pub https_self_signed: Option<bool>,

    /// Address to bind (defaults to the configured host)
    #[arg(long, value_name = "HOST")]
    pub host: Option<String>,

    /// Directory of the prebuilt front-end
    #[arg(long = "static-dir", value_name = "DIR")]
    pub static_dir: Option<PathBuf>,

    /// Write every decoded request to the diagnostic WAV file
    #[arg(long = "dump-input")]
    pub dump_input: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_required_flags() {
        let cli =
            Cli::try_parse_from(["vcs", "-p", "18888", "-c", "config.json", "-m", "G.onnx"])
                .unwrap();
        assert_eq!(cli.port, 18888);
        assert_eq!(cli.model_config, PathBuf::from("config.json"));
        assert_eq!(cli.checkpoint, PathBuf::from("G.onnx"));
        assert_eq!(cli.https, None);
        assert_eq!(cli.https_self_signed, None);
        assert!(!cli.dump_input);

        assert!(Cli::try_parse_from(["vcs", "-c", "config.json", "-m", "G.onnx"]).is_err());
    }

    #[test]
    fn test_strtobool_style_flags() {
        let cli = Cli::try_parse_from([
            "vcs", "-p", "1", "-c", "c", "-m", "m", "--https", "yes", "--httpsSelfSigned", "0",
        ])
        .unwrap();
        assert_eq!(cli.https, Some(true));
        assert_eq!(cli.https_self_signed, Some(false));

        let cli = Cli::try_parse_from(["vcs", "-p", "1", "-c", "c", "-m", "m", "--https"]).unwrap();
        assert_eq!(cli.https, Some(true));
    }

    #[test]
    fn test_key_and_cert_aliases() {
        let cli = Cli::try_parse_from([
            "vcs", "-p", "1", "-c", "c", "-m", "m", "--https-key", "a.key", "--httpsCert", "a.cert",
        ])
        .unwrap();
        assert_eq!(cli.https_key, Some(PathBuf::from("a.key")));
        assert_eq!(cli.https_cert, Some(PathBuf::from("a.cert")));
    }
}
