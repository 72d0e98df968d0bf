use std::sync::Arc;
use std::time::Duration;

use log::debug;
use tokio::sync::watch;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::stats::StatsReportType;

const SAMPLE_INTERVAL: Duration = Duration::from_secs(1);

/// Point-in-time connection quality derived from RTP stats.
///
/// `quality_score` is a 0..=100 composite of round-trip time and packet
/// loss; a fresh connection starts at 100.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ConnectionQuality {
    pub round_trip_time_ms: f64,
    pub packet_loss_rate: f64,
    pub quality_score: u8,
}

impl Default for ConnectionQuality {
    fn default() -> Self {
        Self {
            round_trip_time_ms: 0.0,
            packet_loss_rate: 0.0,
            quality_score: 100,
        }
    }
}

/// Periodically samples a peer connection's stats and publishes quality
/// snapshots on a watch channel. The task ends on its own once the
/// connection closes.
pub struct QualityMonitor;

impl QualityMonitor {
    pub fn spawn(pc: Arc<RTCPeerConnection>, updates: watch::Sender<ConnectionQuality>) {
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(SAMPLE_INTERVAL);
            let mut last_sent: u64 = 0;
            let mut last_lost: i64 = 0;
            loop {
                interval.tick().await;
                if pc.connection_state() == RTCPeerConnectionState::Closed {
                    debug!("quality monitor stopping: connection closed");
                    break;
                }

                let stats = pc.get_stats().await;
                let mut sent: u64 = 0;
                let mut lost: i64 = 0;
                let mut rtt_ms: f64 = 0.0;
                for report in stats.reports.values() {
                    match report {
                        StatsReportType::OutboundRTP(outbound) => {
                            sent += outbound.packets_sent;
                        }
                        StatsReportType::RemoteInboundRTP(remote) => {
                            lost += remote.packets_lost;
                            if let Some(rtt) = remote.round_trip_time {
                                rtt_ms = rtt * 1000.0;
                            }
                        }
                        _ => {}
                    }
                }

                let interval_sent = sent.saturating_sub(last_sent);
                let interval_lost = (lost - last_lost).max(0) as u64;
                last_sent = sent;
                last_lost = lost;

                let loss_rate = if interval_sent + interval_lost > 0 {
                    interval_lost as f64 / (interval_sent + interval_lost) as f64 * 100.0
                } else {
                    0.0
                };

                updates.send_replace(ConnectionQuality {
                    round_trip_time_ms: rtt_ms,
                    packet_loss_rate: loss_rate,
                    quality_score: score(rtt_ms, loss_rate),
                });
            }
        });
    }
}

fn score(rtt_ms: f64, loss_rate: f64) -> u8 {
    let rtt_points = if rtt_ms < 150.0 {
        50
    } else if rtt_ms < 300.0 {
        35
    } else {
        20
    };
    let loss_points = if loss_rate < 1.0 {
        50
    } else if loss_rate < 3.0 {
        35
    } else if loss_rate < 5.0 {
        25
    } else {
        10
    };
    rtt_points + loss_points
}
