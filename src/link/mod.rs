//! Session bootstrap engine.
//!
//! One linking attempt = one wa-rs bot over a fresh session store. The
//! request handler waits for the pairing code (or QR payload) and answers
//! the HTTP request; a background task then waits for the connection to
//! open, delivers the onboarding bundle, and deletes the session material.

pub mod onboarding;
pub mod qr;
pub mod session;
pub mod store;

use anyhow::{Context, anyhow};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

use wa_rs::bot::Bot;
use wa_rs::pair_code::PairCodeOptions;
use wa_rs_binary::jid::Jid;
use wa_rs_core::store::Device as CoreDevice;
use wa_rs_core::store::traits::DeviceStore as _;
use wa_rs_core::types::events::Event;
use wa_rs_tokio_transport::TokioWebSocketTransportFactory;
use wa_rs_ureq_http::UreqHttpClient;

use crate::config::Config;
use crate::error::AppError;
use crate::phone;
use self::session::SessionDir;
use self::store::SessionStore;

/// Pause before rebuilding the bot after a stream error.
const RECONNECT_BACKOFF: Duration = Duration::from_secs(2);
/// Poll interval while waiting for credentials to be persisted.
const ESTABLISH_POLL: Duration = Duration::from_secs(1);

/// Connection-state stream of one linking attempt, reduced to what the
/// engine acts on.
#[derive(Debug)]
enum LinkEvent {
    PairingCode(String),
    QrPayload(String),
    Connected,
    LoggedOut,
    StreamError(String),
}

/// Who receives the onboarding bundle.
enum Recipient {
    /// The phone number that requested a pairing code.
    Number(String),
    /// The phone identity recorded in the persisted credentials (QR flow).
    SelfDevice,
}

/// Why a linking attempt stopped before producing what the caller waited for.
#[derive(Debug)]
enum LinkFailure {
    TimedOut,
    LoggedOut,
    Exhausted(String),
    Fatal(anyhow::Error),
}

impl LinkFailure {
    fn into_app_error(self, waited_for: &str) -> AppError {
        match self {
            LinkFailure::TimedOut => {
                AppError::Timeout(format!("no {waited_for} within the deadline"))
            }
            LinkFailure::LoggedOut => {
                AppError::Unavailable("logged out by WhatsApp; start a new linking attempt".into())
            }
            LinkFailure::Exhausted(err) => {
                AppError::Unavailable(format!("connection failed after multiple attempts: {err}"))
            }
            LinkFailure::Fatal(err) => AppError::Internal(err),
        }
    }
}

impl std::fmt::Display for LinkFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LinkFailure::TimedOut => write!(f, "deadline expired"),
            LinkFailure::LoggedOut => write!(f, "logged out"),
            LinkFailure::Exhausted(err) => write!(f, "reconnect attempts exhausted ({err})"),
            LinkFailure::Fatal(err) => write!(f, "{err:#}"),
        }
    }
}

/// Protocol noise the upstream socket emits during normal linking; logged
/// quietly instead of treated as a failure signal.
fn is_expected_noise(message: &str) -> bool {
    const NOISE: &[&str] = &[
        "conflict",
        "not-authorized",
        "Socket connection timeout",
        "rate-overlimit",
        "Connection Closed",
        "Timed Out",
        "Value not found",
        "Stream Errored",
        "statusCode: 515",
        "statusCode: 503",
    ];
    NOISE.iter().any(|needle| message.contains(needle))
}

/// Group a raw pairing code as `XXXX-XXXX` for display.
fn format_pairing_code(code: &str) -> String {
    if code.contains('-') {
        return code.to_string();
    }
    code.chars()
        .collect::<Vec<_>>()
        .chunks(4)
        .map(|chunk| chunk.iter().collect::<String>())
        .collect::<Vec<_>>()
        .join("-")
}

struct RunningBot {
    client: Arc<wa_rs::Client>,
    handle: tokio::task::JoinHandle<()>,
}

/// Entry point used by the gateway handlers.
pub struct Linker {
    config: Arc<Config>,
}

impl Linker {
    pub fn new(config: Arc<Config>) -> Self {
        Self { config }
    }

    /// Pair flow: validate the number, start a fresh session for it, and
    /// return the grouped pairing code. Delivery and cleanup continue in the
    /// background after the code is handed out.
    pub async fn pair(&self, raw_number: &str) -> Result<String, AppError> {
        let digits =
            phone::normalize(raw_number).map_err(|e| AppError::BadRequest(e.to_string()))?;

        let root = self.config.sessions_root();
        let run = LinkRun::open(
            self.config.clone(),
            SessionDir::for_number(&root, &digits).map_err(AppError::Internal)?,
            Some(digits.clone()),
        )?;

        let (tx, mut rx) = mpsc::channel(32);
        let mut bot = match run.start(tx.clone()).await {
            Ok(bot) => bot,
            Err(e) => {
                run.session.remove();
                return Err(AppError::Unavailable(format!(
                    "failed to start WhatsApp client: {e}"
                )));
            }
        };

        let deadline = Duration::from_secs(self.config.link.pairing_wait_secs);
        let picked = run
            .await_event(&mut bot, &mut rx, &tx, deadline, |event| match event {
                LinkEvent::PairingCode(code) => Some(code),
                _ => None,
            })
            .await;

        let code = match picked {
            Ok(code) => code,
            Err(failure) => {
                bot.handle.abort();
                run.session.remove();
                return Err(failure.into_app_error("pairing code"));
            }
        };

        tracing::info!("pairing code issued for {digits}");
        tokio::spawn(run.attend(bot, rx, tx, Recipient::Number(digits)));
        Ok(format_pairing_code(&code))
    }

    /// QR flow: start a session under a generated key and return the QR
    /// payload rendered as a PNG data URL.
    pub async fn qr(&self) -> Result<String, AppError> {
        let root = self.config.sessions_root();
        let run = LinkRun::open(
            self.config.clone(),
            SessionDir::generated(&root).map_err(AppError::Internal)?,
            None,
        )?;

        let (tx, mut rx) = mpsc::channel(32);
        let mut bot = match run.start(tx.clone()).await {
            Ok(bot) => bot,
            Err(e) => {
                run.session.remove();
                return Err(AppError::Unavailable(format!(
                    "failed to start WhatsApp client: {e}"
                )));
            }
        };

        let deadline = Duration::from_secs(self.config.link.qr_wait_secs);
        let picked = run
            .await_event(&mut bot, &mut rx, &tx, deadline, |event| match event {
                LinkEvent::QrPayload(payload) => Some(payload),
                _ => None,
            })
            .await;

        let payload = match picked {
            Ok(payload) => payload,
            Err(failure) => {
                bot.handle.abort();
                run.session.remove();
                return Err(failure.into_app_error("QR code"));
            }
        };

        let data_url = match qr::png_data_url(&payload) {
            Ok(url) => url,
            Err(e) => {
                bot.handle.abort();
                run.session.remove();
                return Err(AppError::Internal(e));
            }
        };

        tracing::info!("QR payload issued (session {})", run.session.path().display());
        tokio::spawn(run.attend(bot, rx, tx, Recipient::SelfDevice));
        Ok(data_url)
    }
}

/// One linking attempt: config slice, session directory, persistent store.
struct LinkRun {
    config: Arc<Config>,
    session: SessionDir,
    store: Arc<SessionStore>,
    pair_phone: Option<String>,
}

impl LinkRun {
    fn open(
        config: Arc<Config>,
        session: SessionDir,
        pair_phone: Option<String>,
    ) -> Result<Self, AppError> {
        let store = match SessionStore::open(session.db_path()) {
            Ok(store) => Arc::new(store),
            Err(e) => {
                session.remove();
                return Err(AppError::Unavailable(format!(
                    "failed to open session store: {e}"
                )));
            }
        };
        Ok(Self {
            config,
            session,
            store,
            pair_phone,
        })
    }

    /// Build and launch the bot, wiring its event stream into `events`.
    async fn start(&self, events: mpsc::Sender<LinkEvent>) -> anyhow::Result<RunningBot> {
        let mut transport = TokioWebSocketTransportFactory::new();
        let ws_url = self
            .config
            .ws_url
            .clone()
            .or_else(|| std::env::var("WHATSAPP_WS_URL").ok());
        if let Some(url) = ws_url {
            transport = transport.with_url(url);
        }

        let tx = events;
        let mut builder = Bot::builder()
            .with_backend(self.store.clone())
            .with_transport_factory(transport)
            .with_http_client(UreqHttpClient::new())
            .on_event(move |event, _client| {
                let tx = tx.clone();
                async move {
                    let mapped = match event {
                        Event::PairingCode { code, .. } => Some(LinkEvent::PairingCode(code)),
                        Event::PairingQrCode { code, .. } => Some(LinkEvent::QrPayload(code)),
                        Event::Connected(_) => Some(LinkEvent::Connected),
                        Event::LoggedOut(_) => Some(LinkEvent::LoggedOut),
                        Event::StreamError(err) => Some(LinkEvent::StreamError(format!("{err:?}"))),
                        _ => None,
                    };
                    if let Some(event) = mapped {
                        if tx.send(event).await.is_err() {
                            tracing::debug!("link event receiver dropped");
                        }
                    }
                }
            });

        if let Some(phone) = &self.pair_phone {
            builder = builder.with_pair_code(PairCodeOptions {
                phone_number: phone.clone(),
                custom_code: None,
                ..Default::default()
            });
        }

        let mut bot = builder.build().await?;
        let client = bot.client();
        let handle = bot.run().await?;
        Ok(RunningBot { client, handle })
    }

    /// Wait until `pick` matches an event, rebuilding the bot on stream
    /// errors up to the configured bound. `LoggedOut` is terminal.
    async fn await_event<T>(
        &self,
        bot: &mut RunningBot,
        rx: &mut mpsc::Receiver<LinkEvent>,
        tx: &mpsc::Sender<LinkEvent>,
        deadline: Duration,
        mut pick: impl FnMut(LinkEvent) -> Option<T>,
    ) -> Result<T, LinkFailure> {
        let mut attempts = 0u32;
        let waited = tokio::time::timeout(deadline, async {
            loop {
                let Some(event) = rx.recv().await else {
                    return Err(LinkFailure::Fatal(anyhow!("event stream closed")));
                };
                match event {
                    LinkEvent::LoggedOut => return Err(LinkFailure::LoggedOut),
                    LinkEvent::StreamError(err) => {
                        if attempts >= self.config.link.max_reconnects {
                            return Err(LinkFailure::Exhausted(err));
                        }
                        attempts += 1;
                        if is_expected_noise(&err) {
                            tracing::debug!(
                                "stream noise ({err}); reconnect {attempts}/{}",
                                self.config.link.max_reconnects
                            );
                        } else {
                            tracing::warn!(
                                "stream error ({err}); reconnect {attempts}/{}",
                                self.config.link.max_reconnects
                            );
                        }
                        bot.handle.abort();
                        tokio::time::sleep(RECONNECT_BACKOFF).await;
                        *bot = self.start(tx.clone()).await.map_err(LinkFailure::Fatal)?;
                    }
                    other => {
                        if let Some(value) = pick(other) {
                            return Ok(value);
                        }
                    }
                }
            }
        })
        .await;

        match waited {
            Ok(inner) => inner,
            Err(_elapsed) => Err(LinkFailure::TimedOut),
        }
    }

    /// Background phase: wait for the connection to open, deliver the
    /// bundle, then tear everything down and delete the session directory.
    async fn attend(
        self,
        mut bot: RunningBot,
        mut rx: mpsc::Receiver<LinkEvent>,
        tx: mpsc::Sender<LinkEvent>,
        recipient: Recipient,
    ) {
        let deadline = Duration::from_secs(self.config.link.open_wait_secs);
        let opened = self
            .await_event(&mut bot, &mut rx, &tx, deadline, |event| {
                matches!(event, LinkEvent::Connected).then_some(())
            })
            .await;

        match opened {
            Ok(()) => {
                tracing::info!("connected; delivering onboarding bundle");
                if let Err(e) = self.deliver(&bot, &recipient).await {
                    tracing::error!("onboarding delivery failed: {e:#}");
                }
            }
            Err(failure) => {
                tracing::warn!(
                    "link session {} ended before open: {failure}",
                    self.session.path().display()
                );
            }
        }

        tokio::time::sleep(Duration::from_secs(self.config.onboarding.cleanup_delay_secs)).await;
        bot.handle.abort();
        self.session.remove();
    }

    /// Confirm the credentials are persisted, then push the fixed sequence
    /// with the configured gap between sends.
    async fn deliver(&self, bot: &RunningBot, recipient: &Recipient) -> anyhow::Result<()> {
        let device = self.wait_established().await?;

        let jid_str = match recipient {
            Recipient::Number(digits) => Jid::pn(digits.clone()).to_string(),
            Recipient::SelfDevice => device
                .pn
                .as_ref()
                .context("linked device has no phone identity")?
                .to_string(),
        };

        let creds = serde_json::to_vec_pretty(&device)
            .context("failed to serialise device credentials")?;

        let gap = Duration::from_millis(self.config.onboarding.send_gap_ms);
        for payload in onboarding::bundle(&self.config.onboarding, creds) {
            let label = payload.label();
            let to: Jid = jid_str
                .parse()
                .map_err(|e| anyhow!("invalid recipient JID `{jid_str}`: {e}"))?;
            let message_id = bot
                .client
                .send_message(to, payload.into_message())
                .await
                .with_context(|| format!("failed to send onboarding {label}"))?;
            tracing::info!("sent onboarding {label} to {jid_str} (id: {message_id})");
            tokio::time::sleep(gap).await;
        }
        Ok(())
    }

    /// The open event can race credential persistence; poll the store until
    /// a registered device shows up.
    async fn wait_established(&self) -> anyhow::Result<CoreDevice> {
        let give_up = tokio::time::Instant::now()
            + Duration::from_secs(self.config.link.established_wait_secs);
        loop {
            if self.store.exists().await? {
                if let Some(device) = self.store.load().await? {
                    if device.pn.is_some() || device.account.is_some() {
                        return Ok(device);
                    }
                }
            }
            if tokio::time::Instant::now() >= give_up {
                anyhow::bail!(
                    "session not established within {}s",
                    self.config.link.established_wait_secs
                );
            }
            tokio::time::sleep(ESTABLISH_POLL).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::StatusCode;
    use axum::response::IntoResponse;

    #[test]
    fn pairing_code_groups_by_four() {
        assert_eq!(format_pairing_code("ABCDEFGH"), "ABCD-EFGH");
        assert_eq!(format_pairing_code("ABCDEF"), "ABCD-EF");
    }

    #[test]
    fn pairing_code_already_grouped_is_untouched() {
        assert_eq!(format_pairing_code("ABCD-EFGH"), "ABCD-EFGH");
    }

    #[test]
    fn noise_allowlist_matches_known_substrings() {
        assert!(is_expected_noise("Stream Errored (restart required)"));
        assert!(is_expected_noise("server error: statusCode: 515"));
        assert!(is_expected_noise("rate-overlimit while pairing"));
        assert!(!is_expected_noise("database is locked"));
    }

    #[test]
    fn failure_maps_to_http_statuses() {
        let cases = [
            (LinkFailure::TimedOut, StatusCode::REQUEST_TIMEOUT),
            (LinkFailure::LoggedOut, StatusCode::SERVICE_UNAVAILABLE),
            (
                LinkFailure::Exhausted("boom".into()),
                StatusCode::SERVICE_UNAVAILABLE,
            ),
            (
                LinkFailure::Fatal(anyhow!("broken")),
                StatusCode::INTERNAL_SERVER_ERROR,
            ),
        ];
        for (failure, status) in cases {
            let resp = failure.into_app_error("pairing code").into_response();
            assert_eq!(resp.status(), status);
        }
    }

    #[test]
    fn timeout_error_names_what_was_awaited() {
        let err = LinkFailure::TimedOut.into_app_error("QR code");
        assert!(err.to_string().contains("QR code"));
    }
}
