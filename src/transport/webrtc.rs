//! Adapters for webrtc tracks
//!
//! Inbound RTP is read straight off the remote track: there is no jitter or
//! reordering buffer, so loss and reordering reach the decoder unchanged.

use anyhow::Result;
use async_trait::async_trait;
use bytes::Bytes;
use std::sync::Arc;
use std::time::Duration;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;
use webrtc::track::track_remote::TrackRemote;

use super::{AudioSink, AudioSource};

/// Reads Opus payloads from a remote audio track
pub struct RemoteTrackSource {
    track: Arc<TrackRemote>,
    packets: u64,
}

impl RemoteTrackSource {
    pub fn new(track: Arc<TrackRemote>) -> Self {
        Self { track, packets: 0 }
    }
}

#[async_trait]
impl AudioSource for RemoteTrackSource {
    async fn read_unit(&mut self) -> Result<Option<Bytes>> {
        match self.track.read_rtp().await {
            Ok((packet, _)) => {
                self.packets += 1;
                Ok(Some(packet.payload))
            }
            Err(e) => {
                // Closed and failed tracks look the same from here: the call leg is over
                log::info!(
                    "Remote track {} ended after {} packets: {}",
                    self.track.id(),
                    self.packets,
                    e
                );
                Ok(None)
            }
        }
    }
}

/// Writes Opus payloads to a local sample track
pub struct LocalTrackSink {
    track: Arc<TrackLocalStaticSample>,
}

impl LocalTrackSink {
    pub fn new(track: Arc<TrackLocalStaticSample>) -> Self {
        Self { track }
    }
}

#[async_trait]
impl AudioSink for LocalTrackSink {
    async fn write_unit(&mut self, payload: Bytes, duration: Duration) -> Result<()> {
        let sample = webrtc::media::Sample {
            data: payload,
            duration,
            ..Default::default()
        };
        self.track
            .write_sample(&sample)
            .await
            .map_err(|e| anyhow::anyhow!("Failed to send audio sample: {}", e))
    }
}
