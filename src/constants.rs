//! Constants affecting the shape and timing of the voice session.

use discortp::rtp::RtpType;
use std::time::Duration;

/// The voice gateway version spoken by this crate.
pub const VOICE_GATEWAY_VERSION: u8 = 8;

/// Sample rate of audio carried over the session.
pub const SAMPLE_RATE_RAW: usize = 48_000;

/// Number of audio frames/packets to be sent per second.
pub const AUDIO_FRAME_RATE: usize = 50;

/// Length of time between any two audio frames.
pub const TIMESTEP_LENGTH: Duration = Duration::from_millis(1000 / AUDIO_FRAME_RATE as u64);

/// Number of samples in one complete frame of audio per channel.
pub const MONO_FRAME_SIZE: usize = SAMPLE_RATE_RAW / AUDIO_FRAME_RATE;

/// Number of individual samples in one complete frame of stereo audio.
pub const STEREO_FRAME_SIZE: usize = 2 * MONO_FRAME_SIZE;

/// Number of bytes in one complete frame of raw s16-LE stereo audio.
pub const STEREO_FRAME_BYTE_SIZE: usize = STEREO_FRAME_SIZE * std::mem::size_of::<i16>();

/// Length (in milliseconds) of any audio frame.
pub const FRAME_LEN_MS: usize = 1000 / AUDIO_FRAME_RATE;

/// Maximum packet size for a voice packet.
///
/// Set a safe amount below the Ethernet MTU to avoid fragmentation/rejection.
pub const VOICE_PACKET_MAX: usize = 1460;

/// Delay between sends of UDP keepalive frames.
///
/// The live service fires these every 5 seconds irrespective of outgoing
/// audio traffic; they exist to hold NAT bindings open.
pub const UDP_KEEPALIVE_GAP: Duration = Duration::from_millis(5_000);

/// Size of the UDP keepalive datagram: the session SSRC plus zero padding.
pub const UDP_KEEPALIVE_LEN: usize = 8;

/// Opus silent frame, used to signal speech start and end (and prevent audio glitching).
pub const SILENT_FRAME: [u8; 3] = [0xf8, 0xff, 0xfe];

/// Number of silent frames sent after a burst ends, before the speaking flag drops.
pub const SILENT_FRAME_COUNT: u8 = 5;

/// The one (and only) RTP version.
pub const RTP_VERSION: u8 = 2;

/// Profile type used by the voice service's Opus audio traffic.
pub const RTP_PROFILE_TYPE: RtpType = RtpType::Dynamic(120);

/// Fixed delay before redialling after a recoverable websocket closure.
pub const RECONNECT_DELAY: Duration = Duration::from_secs(2);

/// Inbound packets from SSRCs with no known user are buffered at most this long.
pub const UNMAPPED_SSRC_TTL: Duration = Duration::from_secs(2);

/// Bound on the number of buffered datagrams from unmapped SSRCs.
pub const UNMAPPED_SSRC_LIMIT: usize = 64;
