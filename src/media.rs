use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use log::{debug, warn};
use tokio::sync::{mpsc, watch};
use webrtc::api::media_engine::{MediaEngine, MIME_TYPE_OPUS, MIME_TYPE_VP8};
use webrtc::api::APIBuilder;
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::media::Sample;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::RTCRtpCodecCapability;
use webrtc::rtp_transceiver::rtp_receiver::RTCRtpReceiver;
use webrtc::rtp_transceiver::RTCRtpTransceiver;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;
use webrtc::track::track_local::TrackLocal;
use webrtc::track::track_remote::TrackRemote;

use crate::audio::AudioCapture;
use crate::config::RoomConfig;
use crate::error::{Error, Result};
use crate::metrics::{ConnectionQuality, QualityMonitor};
use crate::signaling::IceCandidate;

/// Events the media layer pushes into the session loop.
#[derive(Debug)]
pub enum MediaEvent<R> {
    /// A locally discovered candidate to relay to the counterpart.
    LocalCandidate(IceCandidate),
    /// Remote media started flowing; the call is effectively connected.
    RemoteTrack(R),
}

/// Seam between the call engine and the media stack. `WebRtcMedia` is the
/// production implementation; tests drive the engine through a fake.
///
/// Contract highlights: at most one peer connection is live at a time, and
/// candidates handed over before the remote description is applied are
/// buffered, not dropped. Local capture outlives individual call attempts:
/// `close_connection` tears down one attempt, `release` additionally stops
/// capture and is only called on room leave. Both are idempotent.
#[async_trait]
pub trait MediaPort: Send + 'static {
    /// Handle to remote media, surfaced to the presentation layer.
    type Remote: Clone + Send + Sync + 'static;

    async fn acquire_local_media(&mut self) -> Result<()>;
    async fn create_peer_connection(
        &mut self,
        events: mpsc::Sender<MediaEvent<Self::Remote>>,
    ) -> Result<()>;
    async fn create_offer(&mut self) -> Result<String>;
    async fn create_answer(&mut self, remote_offer: &str) -> Result<String>;
    async fn apply_remote_description(&mut self, description: &str) -> Result<()>;
    async fn add_remote_ice_candidate(&mut self, candidate: IceCandidate) -> Result<()>;
    fn toggle_audio(&mut self) -> bool;
    fn toggle_video(&mut self) -> bool;
    async fn close_connection(&mut self);
    async fn release(&mut self);
}

/// Local capture state: one audio and one video sample track, each with a
/// mute gate. Tracks are created up front and survive individual call
/// attempts; the microphone is only held between acquire and release.
struct LocalMedia {
    audio_track: Arc<TrackLocalStaticSample>,
    video_track: Arc<TrackLocalStaticSample>,
    audio_enabled: Arc<AtomicBool>,
    video_enabled: Arc<AtomicBool>,
    capture: Option<AudioCapture>,
}

impl LocalMedia {
    fn new() -> Self {
        let audio_track = Arc::new(TrackLocalStaticSample::new(
            RTCRtpCodecCapability {
                mime_type: MIME_TYPE_OPUS.to_owned(),
                ..Default::default()
            },
            "audio".to_owned(),
            "rooms-client".to_owned(),
        ));
        let video_track = Arc::new(TrackLocalStaticSample::new(
            RTCRtpCodecCapability {
                mime_type: MIME_TYPE_VP8.to_owned(),
                ..Default::default()
            },
            "video".to_owned(),
            "rooms-client".to_owned(),
        ));
        Self {
            audio_track,
            video_track,
            audio_enabled: Arc::new(AtomicBool::new(true)),
            video_enabled: Arc::new(AtomicBool::new(true)),
            capture: None,
        }
    }

    fn tracks(&self) -> Vec<Arc<dyn TrackLocal + Send + Sync>> {
        vec![
            Arc::clone(&self.audio_track) as Arc<dyn TrackLocal + Send + Sync>,
            Arc::clone(&self.video_track) as Arc<dyn TrackLocal + Send + Sync>,
        ]
    }

    fn toggle(flag: &AtomicBool) -> bool {
        !flag.fetch_xor(true, Ordering::Relaxed)
    }
}

/// Application-side handle for pushing video frames into the local video
/// track. Frames written while video is toggled off are dropped.
#[derive(Clone)]
pub struct VideoFeed {
    track: Arc<TrackLocalStaticSample>,
    enabled: Arc<AtomicBool>,
}

impl VideoFeed {
    pub async fn write_sample(&self, sample: &Sample) -> Result<()> {
        if !self.enabled.load(Ordering::Relaxed) {
            return Ok(());
        }
        self.track.write_sample(sample).await?;
        Ok(())
    }
}

/// Production media stack: microphone capture via `cpal`, peer connection
/// and tracks via the `webrtc` crate, STUN servers from `RoomConfig`.
pub struct WebRtcMedia {
    ice_servers: Vec<String>,
    local: LocalMedia,
    pc: Option<Arc<RTCPeerConnection>>,
    pending_candidates: Vec<IceCandidate>,
    remote_description_set: bool,
    quality: watch::Sender<ConnectionQuality>,
    quality_rx: watch::Receiver<ConnectionQuality>,
}

impl WebRtcMedia {
    pub fn new(config: &RoomConfig) -> Self {
        let (quality, quality_rx) = watch::channel(ConnectionQuality::default());
        Self {
            ice_servers: config.ice_servers.clone(),
            local: LocalMedia::new(),
            pc: None,
            pending_candidates: Vec::new(),
            remote_description_set: false,
            quality,
            quality_rx,
        }
    }

    /// Connection quality snapshots, updated once per second while a peer
    /// connection is live.
    pub fn quality(&self) -> watch::Receiver<ConnectionQuality> {
        self.quality_rx.clone()
    }

    /// Handle for feeding locally produced video frames. Available before
    /// the room is joined so the embedding application can wire its camera
    /// pipeline up front.
    pub fn video_feed(&self) -> VideoFeed {
        VideoFeed {
            track: Arc::clone(&self.local.video_track),
            enabled: Arc::clone(&self.local.video_enabled),
        }
    }

    fn pc(&self) -> Result<&Arc<RTCPeerConnection>> {
        self.pc.as_ref().ok_or(Error::PeerConnectionClosed)
    }

    async fn apply_candidate(pc: &RTCPeerConnection, candidate: IceCandidate) {
        let init = RTCIceCandidateInit {
            candidate: candidate.candidate,
            sdp_mid: candidate.sdp_mid,
            sdp_mline_index: candidate.sdp_mline_index,
            username_fragment: None,
        };
        // Failures here are expected under teardown races; log and move on.
        if let Err(e) = pc.add_ice_candidate(init).await {
            warn!("discarding undeliverable remote candidate: {e}");
        }
    }

    #[cfg(test)]
    fn buffered_candidates(&self) -> usize {
        self.pending_candidates.len()
    }
}

#[async_trait]
impl MediaPort for WebRtcMedia {
    type Remote = Arc<TrackRemote>;

    async fn acquire_local_media(&mut self) -> Result<()> {
        if self.local.capture.is_none() {
            let capture = AudioCapture::start(
                Arc::clone(&self.local.audio_track),
                Arc::clone(&self.local.audio_enabled),
            )?;
            self.local.capture = Some(capture);
        }
        Ok(())
    }

    async fn create_peer_connection(
        &mut self,
        events: mpsc::Sender<MediaEvent<Self::Remote>>,
    ) -> Result<()> {
        // At most one live connection: the previous one is closed before a
        // replacement exists.
        if let Some(old) = self.pc.take() {
            if let Err(e) = old.close().await {
                warn!("closing previous peer connection: {e}");
            }
        }
        self.remote_description_set = false;
        self.pending_candidates.clear();

        let mut media_engine = MediaEngine::default();
        media_engine.register_default_codecs()?;
        let api = APIBuilder::new().with_media_engine(media_engine).build();

        let rtc_config = RTCConfiguration {
            ice_servers: vec![RTCIceServer {
                urls: self.ice_servers.clone(),
                ..Default::default()
            }],
            ..Default::default()
        };
        let pc = Arc::new(api.new_peer_connection(rtc_config).await?);

        for track in self.local.tracks() {
            pc.add_track(track).await?;
        }

        let candidate_events = events.clone();
        pc.on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
            let events = candidate_events.clone();
            Box::pin(async move {
                let Some(candidate) = candidate else { return };
                match candidate.to_json() {
                    Ok(init) => {
                        let _ = events
                            .send(MediaEvent::LocalCandidate(IceCandidate {
                                candidate: init.candidate,
                                sdp_mid: init.sdp_mid,
                                sdp_mline_index: init.sdp_mline_index,
                            }))
                            .await;
                    }
                    Err(e) => warn!("failed to serialize local candidate: {e}"),
                }
            })
        }));

        let track_events = events;
        pc.on_track(Box::new(
            move |track: Arc<TrackRemote>,
                  _receiver: Arc<RTCRtpReceiver>,
                  _transceiver: Arc<RTCRtpTransceiver>| {
                let events = track_events.clone();
                Box::pin(async move {
                    let _ = events.send(MediaEvent::RemoteTrack(track)).await;
                })
            },
        ));

        pc.on_peer_connection_state_change(Box::new(move |state: RTCPeerConnectionState| {
            Box::pin(async move {
                debug!("peer connection state: {state}");
            })
        }));

        QualityMonitor::spawn(Arc::clone(&pc), self.quality.clone());

        self.pc = Some(pc);
        Ok(())
    }

    async fn create_offer(&mut self) -> Result<String> {
        let pc = self.pc()?;
        let offer = pc.create_offer(None).await?;
        pc.set_local_description(offer.clone()).await?;
        Ok(serde_json::to_string(&offer)?)
    }

    async fn create_answer(&mut self, remote_offer: &str) -> Result<String> {
        self.apply_remote_description(remote_offer).await?;
        let pc = self.pc()?;
        let answer = pc.create_answer(None).await?;
        pc.set_local_description(answer.clone()).await?;
        Ok(serde_json::to_string(&answer)?)
    }

    async fn apply_remote_description(&mut self, description: &str) -> Result<()> {
        let pc = self.pc.clone().ok_or(Error::PeerConnectionClosed)?;
        let desc: RTCSessionDescription = serde_json::from_str(description)
            .map_err(|e| Error::NegotiationError(format!("malformed session description: {e}")))?;
        pc.set_remote_description(desc)
            .await
            .map_err(|e| Error::NegotiationError(e.to_string()))?;
        self.remote_description_set = true;
        for candidate in std::mem::take(&mut self.pending_candidates) {
            Self::apply_candidate(&pc, candidate).await;
        }
        Ok(())
    }

    async fn add_remote_ice_candidate(&mut self, candidate: IceCandidate) -> Result<()> {
        let Some(pc) = self.pc.clone() else {
            // Late arrival after teardown; expected, not an error.
            debug!("discarding candidate with no live peer connection");
            return Ok(());
        };
        if !self.remote_description_set {
            self.pending_candidates.push(candidate);
            return Ok(());
        }
        Self::apply_candidate(&pc, candidate).await;
        Ok(())
    }

    fn toggle_audio(&mut self) -> bool {
        LocalMedia::toggle(&self.local.audio_enabled)
    }

    fn toggle_video(&mut self) -> bool {
        LocalMedia::toggle(&self.local.video_enabled)
    }

    async fn close_connection(&mut self) {
        if let Some(pc) = self.pc.take() {
            if let Err(e) = pc.close().await {
                debug!("closing peer connection: {e}");
            }
        }
        self.pending_candidates.clear();
        self.remote_description_set = false;
    }

    async fn release(&mut self) {
        self.close_connection().await;
        self.local.capture = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn media() -> WebRtcMedia {
        WebRtcMedia::new(&RoomConfig::default())
    }

    fn bogus_candidate() -> IceCandidate {
        IceCandidate {
            candidate: "candidate:0 1 UDP 2122252543 192.0.2.1 50000 typ host".into(),
            sdp_mid: Some("0".into()),
            sdp_mline_index: Some(0),
        }
    }

    #[tokio::test]
    async fn offer_answer_round_trip_between_two_connections() {
        let (tx, _rx) = mpsc::channel(8);
        let mut offerer = media();
        let mut answerer = media();
        offerer.create_peer_connection(tx.clone()).await.unwrap();
        answerer.create_peer_connection(tx.clone()).await.unwrap();

        let offer = offerer.create_offer().await.unwrap();
        let answer = answerer.create_answer(&offer).await.unwrap();
        offerer.apply_remote_description(&answer).await.unwrap();
    }

    #[tokio::test]
    async fn candidates_before_remote_description_are_buffered_then_replayed() {
        let (tx, _rx) = mpsc::channel(8);
        let mut offerer = media();
        let mut answerer = media();
        offerer.create_peer_connection(tx.clone()).await.unwrap();
        answerer.create_peer_connection(tx.clone()).await.unwrap();

        answerer
            .add_remote_ice_candidate(bogus_candidate())
            .await
            .unwrap();
        assert_eq!(answerer.buffered_candidates(), 1);

        let offer = offerer.create_offer().await.unwrap();
        answerer.create_answer(&offer).await.unwrap();
        assert_eq!(answerer.buffered_candidates(), 0);
    }

    #[tokio::test]
    async fn candidate_without_connection_is_discarded_not_fatal() {
        let mut m = media();
        m.add_remote_ice_candidate(bogus_candidate()).await.unwrap();
        assert_eq!(m.buffered_candidates(), 0);
    }

    #[tokio::test]
    async fn applying_answer_without_prior_offer_is_a_negotiation_error() {
        let (tx, _rx) = mpsc::channel(8);
        let mut offerer = media();
        let mut answerer = media();
        offerer.create_peer_connection(tx.clone()).await.unwrap();
        answerer.create_peer_connection(tx.clone()).await.unwrap();
        let offer = offerer.create_offer().await.unwrap();
        let answer = answerer.create_answer(&offer).await.unwrap();

        let mut fresh = media();
        fresh.create_peer_connection(tx.clone()).await.unwrap();
        let err = fresh.apply_remote_description(&answer).await.unwrap_err();
        assert!(matches!(err, Error::NegotiationError(_)));
    }

    #[tokio::test]
    async fn malformed_description_is_a_negotiation_error() {
        let (tx, _rx) = mpsc::channel(8);
        let mut m = media();
        m.create_peer_connection(tx).await.unwrap();
        let err = m.apply_remote_description("not json").await.unwrap_err();
        assert!(matches!(err, Error::NegotiationError(_)));
    }

    #[tokio::test]
    async fn operations_after_release_report_closed_connection() {
        let (tx, _rx) = mpsc::channel(8);
        let mut m = media();
        m.create_peer_connection(tx).await.unwrap();
        m.release().await;
        assert!(matches!(
            m.create_offer().await.unwrap_err(),
            Error::PeerConnectionClosed
        ));
    }

    #[tokio::test]
    async fn release_is_idempotent() {
        let (tx, _rx) = mpsc::channel(8);
        let mut m = media();
        m.create_peer_connection(tx).await.unwrap();
        m.release().await;
        m.release().await;
        assert!(m.pc.is_none());
    }

    #[tokio::test]
    async fn replacing_a_connection_closes_the_previous_one() {
        let (tx, _rx) = mpsc::channel(8);
        let mut m = media();
        m.create_peer_connection(tx.clone()).await.unwrap();
        let first = m.pc.clone().unwrap();
        m.create_peer_connection(tx).await.unwrap();
        assert_eq!(
            first.connection_state(),
            RTCPeerConnectionState::Closed
        );
    }

    #[test]
    fn toggles_flip_and_report_the_new_state() {
        let mut m = media();
        assert!(!m.toggle_audio());
        assert!(m.toggle_audio());
        assert!(!m.toggle_video());
        assert!(!m.video_feed().enabled.load(Ordering::Relaxed));
    }
}
