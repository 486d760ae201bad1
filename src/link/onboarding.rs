//! The fixed onboarding bundle pushed to a freshly linked account.
//!
//! Payloads are plain data so the sequence can be inspected in tests; the
//! engine converts each one into a wire message right before sending.

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use sha2::{Digest, Sha256};
use wa_rs_proto::whatsapp as wa;

use crate::config::OnboardingConfig;

/// One outbound message of the onboarding sequence.
#[derive(Debug, Clone)]
pub enum OutboundPayload {
    Image {
        url: String,
        caption: String,
    },
    /// Inline document, shipped as a base64 `data:` URL.
    Document {
        bytes: Vec<u8>,
        file_name: String,
        mimetype: String,
    },
    VoiceNote {
        url: String,
        seconds: u32,
    },
    Text {
        body: String,
    },
}

impl OutboundPayload {
    pub fn label(&self) -> &'static str {
        match self {
            OutboundPayload::Image { .. } => "image",
            OutboundPayload::Document { .. } => "document",
            OutboundPayload::VoiceNote { .. } => "voice note",
            OutboundPayload::Text { .. } => "text",
        }
    }

    /// Build the wire message for this payload.
    pub fn into_message(self) -> wa::Message {
        match self {
            OutboundPayload::Image { url, caption } => wa::Message {
                image_message: Some(
                    wa::message::ImageMessage {
                        url: Some(url),
                        mimetype: Some("image/jpeg".into()),
                        caption: Some(caption),
                        ..Default::default()
                    }
                    .into(),
                ),
                ..Default::default()
            },
            OutboundPayload::Document {
                bytes,
                file_name,
                mimetype,
            } => {
                let digest = Sha256::digest(&bytes);
                wa::Message {
                    document_message: Some(
                        wa::message::DocumentMessage {
                            url: Some(format!(
                                "data:{};base64,{}",
                                mimetype,
                                BASE64.encode(&bytes)
                            )),
                            mimetype: Some(mimetype),
                            file_name: Some(file_name.clone()),
                            title: Some(file_name),
                            file_length: Some(bytes.len() as u64),
                            file_sha256: Some(digest.to_vec()),
                            ..Default::default()
                        }
                        .into(),
                    ),
                    ..Default::default()
                }
            }
            OutboundPayload::VoiceNote { url, seconds } => wa::Message {
                audio_message: Some(
                    wa::message::AudioMessage {
                        url: Some(url),
                        // WhatsApp only renders push-to-talk audio as a
                        // voice note with this exact mimetype.
                        mimetype: Some("audio/ogg; codecs=opus".into()),
                        ptt: Some(true),
                        seconds: Some(seconds),
                        ..Default::default()
                    }
                    .into(),
                ),
                ..Default::default()
            },
            OutboundPayload::Text { body } => wa::Message {
                conversation: Some(body),
                ..Default::default()
            },
        }
    }
}

/// The delivery sequence, in order: welcome image, credential file, voice
/// note, video-guide image, warning text.
pub fn bundle(cfg: &OnboardingConfig, creds: Vec<u8>) -> Vec<OutboundPayload> {
    vec![
        OutboundPayload::Image {
            url: cfg.welcome_image_url.clone(),
            caption: cfg.welcome_caption.clone(),
        },
        OutboundPayload::Document {
            bytes: creds,
            file_name: cfg.creds_file_name.clone(),
            mimetype: "application/json".into(),
        },
        OutboundPayload::VoiceNote {
            url: cfg.voice_note_url.clone(),
            seconds: cfg.voice_note_secs,
        },
        OutboundPayload::Image {
            url: cfg.guide_image_url.clone(),
            caption: cfg.guide_caption.clone(),
        },
        OutboundPayload::Text {
            body: cfg.warning_text.clone(),
        },
    ]
}
