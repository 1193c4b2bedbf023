use std::sync::Arc;

use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::{MediaEngine, MIME_TYPE_OPUS, MIME_TYPE_VP8};
use webrtc::api::setting_engine::SettingEngine;
use webrtc::api::{APIBuilder, API};
use webrtc::ice::mdns::MulticastDnsMode;
use webrtc::ice::network_type::NetworkType;
use webrtc::ice_transport::ice_credential_type::RTCIceCredentialType;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::rtp_transceiver::rtp_codec::{
    RTCRtpCodecCapability, RTCRtpCodecParameters, RTPCodecType,
};
use webrtc::rtp_transceiver::RTCPFeedback;

use crate::config::IceConfig;
use crate::error::Result;

pub fn video_capability() -> RTCRtpCodecCapability {
    RTCRtpCodecCapability {
        mime_type: MIME_TYPE_VP8.to_owned(),
        clock_rate: 90000,
        channels: 0,
        sdp_fmtp_line: "".to_owned(),
        // Keyframe recovery for late joiners depends on PLI/FIR
        rtcp_feedback: vec![
            RTCPFeedback {
                typ: "goog-remb".to_owned(),
                parameter: "".to_owned(),
            },
            RTCPFeedback {
                typ: "ccm".to_owned(),
                parameter: "fir".to_owned(),
            },
            RTCPFeedback {
                typ: "nack".to_owned(),
                parameter: "".to_owned(),
            },
            RTCPFeedback {
                typ: "nack".to_owned(),
                parameter: "pli".to_owned(),
            },
        ],
    }
}

pub fn audio_capability() -> RTCRtpCodecCapability {
    RTCRtpCodecCapability {
        mime_type: MIME_TYPE_OPUS.to_owned(),
        clock_rate: 48000,
        channels: 2,
        sdp_fmtp_line: "minptime=10;useinbandfec=1".to_owned(),
        rtcp_feedback: vec![],
    }
}

/// Builds the shared WebRTC API: VP8 video, Opus audio, IPv4 only.
pub fn create_webrtc_api() -> Result<Arc<API>> {
    let mut media_engine = MediaEngine::default();

    media_engine.register_codec(
        RTCRtpCodecParameters {
            capability: video_capability(),
            payload_type: 96,
            ..Default::default()
        },
        RTPCodecType::Video,
    )?;

    media_engine.register_codec(
        RTCRtpCodecParameters {
            capability: audio_capability(),
            payload_type: 111,
            ..Default::default()
        },
        RTPCodecType::Audio,
    )?;

    let mut registry = Registry::new();
    registry = register_default_interceptors(registry, &mut media_engine)?;

    // IPv6 binding fails on many exam-room networks
    let mut setting_engine = SettingEngine::default();
    setting_engine.set_network_types(vec![NetworkType::Udp4, NetworkType::Tcp4]);
    setting_engine.set_ice_multicast_dns_mode(MulticastDnsMode::Disabled);

    let api = APIBuilder::new()
        .with_media_engine(media_engine)
        .with_interceptor_registry(registry)
        .with_setting_engine(setting_engine)
        .build();

    Ok(Arc::new(api))
}

pub fn get_ice_servers(config: &IceConfig) -> Vec<RTCIceServer> {
    let mut ice_servers: Vec<RTCIceServer> = config
        .stun_servers
        .iter()
        .map(|url| RTCIceServer {
            urls: vec![url.clone()],
            ..Default::default()
        })
        .collect();

    for turn in &config.turn_servers {
        ice_servers.push(RTCIceServer {
            urls: turn.urls.clone(),
            username: turn.username.clone(),
            credential: turn.credential.clone(),
            credential_type: RTCIceCredentialType::Password,
        });
    }

    ice_servers
}

pub fn rtc_configuration(config: &IceConfig) -> RTCConfiguration {
    RTCConfiguration {
        ice_servers: get_ice_servers(config),
        ..Default::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TurnServer;

    #[test]
    fn test_ice_servers_include_turn_credentials() {
        let config = IceConfig {
            stun_servers: vec!["stun:stun.example:3478".into()],
            turn_servers: vec![TurnServer {
                urls: vec!["turn:turn.example:3478".into()],
                username: "proctor".into(),
                credential: "secret".into(),
            }],
        };

        let servers = get_ice_servers(&config);
        assert_eq!(servers.len(), 2);
        assert_eq!(servers[0].urls, vec!["stun:stun.example:3478".to_string()]);
        assert!(servers[0].username.is_empty());
        assert_eq!(servers[1].username, "proctor");
        assert_eq!(servers[1].credential_type, RTCIceCredentialType::Password);
    }

    #[test]
    fn test_video_codec_requests_keyframe_feedback() {
        let video = video_capability();
        assert_eq!(video.mime_type, MIME_TYPE_VP8);
        assert!(video
            .rtcp_feedback
            .iter()
            .any(|fb| fb.typ == "nack" && fb.parameter == "pli"));
    }

    #[test]
    fn test_api_builds() {
        assert!(create_webrtc_api().is_ok());
    }
}
