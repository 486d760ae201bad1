use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

/// Service configuration, loaded from a TOML file.
///
/// Every field has a default so an absent or empty file yields a working
/// local setup. `sessions_dir` supports `~` expansion.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_sessions_dir")]
    pub sessions_dir: String,
    /// Override for the WhatsApp Web websocket endpoint. Falls back to the
    /// `WHATSAPP_WS_URL` environment variable, then the library default.
    #[serde(default)]
    pub ws_url: Option<String>,
    #[serde(default)]
    pub link: LinkConfig,
    #[serde(default)]
    pub onboarding: OnboardingConfig,
}

/// Deadlines and retry bounds for one linking session.
#[derive(Debug, Clone, Deserialize)]
pub struct LinkConfig {
    /// How long `/pair` waits for the pairing code before giving up.
    #[serde(default = "default_pairing_wait_secs")]
    pub pairing_wait_secs: u64,
    /// How long `/qr` waits for the QR payload before giving up.
    #[serde(default = "default_qr_wait_secs")]
    pub qr_wait_secs: u64,
    /// How long the background task waits for the user to finish linking.
    #[serde(default = "default_open_wait_secs")]
    pub open_wait_secs: u64,
    /// How long to poll for persisted credentials after the connection opens.
    #[serde(default = "default_established_wait_secs")]
    pub established_wait_secs: u64,
    /// Stream-error reconnects before the session is abandoned.
    #[serde(default = "default_max_reconnects")]
    pub max_reconnects: u32,
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            pairing_wait_secs: default_pairing_wait_secs(),
            qr_wait_secs: default_qr_wait_secs(),
            open_wait_secs: default_open_wait_secs(),
            established_wait_secs: default_established_wait_secs(),
            max_reconnects: default_max_reconnects(),
        }
    }
}

/// The fixed message bundle pushed to a freshly linked account.
#[derive(Debug, Clone, Deserialize)]
pub struct OnboardingConfig {
    #[serde(default = "default_welcome_image_url")]
    pub welcome_image_url: String,
    #[serde(default = "default_welcome_caption")]
    pub welcome_caption: String,
    #[serde(default = "default_creds_file_name")]
    pub creds_file_name: String,
    #[serde(default = "default_voice_note_url")]
    pub voice_note_url: String,
    #[serde(default = "default_voice_note_secs")]
    pub voice_note_secs: u32,
    #[serde(default = "default_guide_image_url")]
    pub guide_image_url: String,
    #[serde(default = "default_guide_caption")]
    pub guide_caption: String,
    #[serde(default = "default_warning_text")]
    pub warning_text: String,
    /// Gap between consecutive sends.
    #[serde(default = "default_send_gap_ms")]
    pub send_gap_ms: u64,
    /// Grace period between the last send and session deletion.
    #[serde(default = "default_cleanup_delay_secs")]
    pub cleanup_delay_secs: u64,
}

impl Default for OnboardingConfig {
    fn default() -> Self {
        Self {
            welcome_image_url: default_welcome_image_url(),
            welcome_caption: default_welcome_caption(),
            creds_file_name: default_creds_file_name(),
            voice_note_url: default_voice_note_url(),
            voice_note_secs: default_voice_note_secs(),
            guide_image_url: default_guide_image_url(),
            guide_caption: default_guide_caption(),
            warning_text: default_warning_text(),
            send_gap_ms: default_send_gap_ms(),
            cleanup_delay_secs: default_cleanup_delay_secs(),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            sessions_dir: default_sessions_dir(),
            ws_url: None,
            link: LinkConfig::default(),
            onboarding: OnboardingConfig::default(),
        }
    }
}

impl Config {
    /// Load from `path`, or fall back to defaults when the file is absent.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            tracing::info!("no config file at {}, using defaults", path.display());
            return Ok(Self::default());
        }
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file {}", path.display()))?;
        let config: Config = toml::from_str(&contents)
            .with_context(|| format!("failed to parse config file {}", path.display()))?;
        Ok(config)
    }

    /// Sessions root with `~` expanded.
    pub fn sessions_root(&self) -> PathBuf {
        PathBuf::from(shellexpand::tilde(&self.sessions_dir).into_owned())
    }
}

fn default_host() -> String {
    "127.0.0.1".into()
}
fn default_port() -> u16 {
    8787
}
fn default_sessions_dir() -> String {
    "./sessions".into()
}
fn default_pairing_wait_secs() -> u64 {
    30
}
fn default_qr_wait_secs() -> u64 {
    30
}
fn default_open_wait_secs() -> u64 {
    300
}
fn default_established_wait_secs() -> u64 {
    30
}
fn default_max_reconnects() -> u32 {
    3
}
fn default_welcome_image_url() -> String {
    "https://files.catbox.moe/mqtfum.jpg".into()
}
fn default_welcome_caption() -> String {
    "Connected successfully!\n\nYour session is now active and ready to use. \
     The credential file arrives in the next message."
        .into()
}
fn default_creds_file_name() -> String {
    "creds.json".into()
}
fn default_voice_note_url() -> String {
    "https://files.catbox.moe/1ilyhr.mp3".into()
}
fn default_voice_note_secs() -> u32 {
    30
}
fn default_guide_image_url() -> String {
    "https://img.youtube.com/vi/linkgate-setup/maxresdefault.jpg".into()
}
fn default_guide_caption() -> String {
    "Full setup guide. Watch before importing your session.".into()
}
fn default_warning_text() -> String {
    "SECURITY NOTICE\n\nDo not share the credential file with anybody. \
     It contains your WhatsApp session keys; anyone holding it can act as \
     this account. Keep a private backup and delete stray copies."
        .into()
}
fn default_send_gap_ms() -> u64 {
    1500
}
fn default_cleanup_delay_secs() -> u64 {
    2
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_bind_to_loopback() {
        let cfg = Config::default();
        assert_eq!(cfg.host, "127.0.0.1");
        assert_eq!(cfg.port, 8787);
        assert_eq!(cfg.link.max_reconnects, 3);
        assert_eq!(cfg.onboarding.creds_file_name, "creds.json");
    }

    #[test]
    fn missing_file_falls_back_to_defaults() {
        let cfg = Config::load(Path::new("/nonexistent/linkgate.toml")).unwrap();
        assert_eq!(cfg.port, Config::default().port);
    }

    #[test]
    fn partial_toml_keeps_section_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("linkgate.toml");
        std::fs::write(
            &path,
            "port = 9000\n\n[link]\nqr_wait_secs = 5\n",
        )
        .unwrap();

        let cfg = Config::load(&path).unwrap();
        assert_eq!(cfg.port, 9000);
        assert_eq!(cfg.link.qr_wait_secs, 5);
        // untouched fields keep their defaults
        assert_eq!(cfg.link.pairing_wait_secs, 30);
        assert_eq!(cfg.host, "127.0.0.1");
        assert_eq!(cfg.onboarding.send_gap_ms, 1500);
    }

    #[test]
    fn malformed_toml_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("linkgate.toml");
        std::fs::write(&path, "port = \"not a number").unwrap();
        assert!(Config::load(&path).is_err());
    }

    #[test]
    fn sessions_root_expands_tilde() {
        let cfg = Config {
            sessions_dir: "~/linkgate-sessions".into(),
            ..Config::default()
        };
        let root = cfg.sessions_root();
        assert!(!root.to_string_lossy().contains('~'));
        assert!(root.to_string_lossy().ends_with("linkgate-sessions"));
    }
}
