//! Call media state: mute, camera and screen-share flags plus the outgoing
//! video track. Torn down whenever the owning connection closes.

use std::sync::Arc;

use tracing::{debug, info};

use crate::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrackSource {
    Camera,
    Display,
}

/// A local or remote video track
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VideoTrack {
    pub id: String,
    pub source: TrackSource,
}

impl VideoTrack {
    pub fn camera(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            source: TrackSource::Camera,
        }
    }

    pub fn display(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            source: TrackSource::Display,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MediaStream {
    pub id: String,
    pub audio_enabled: bool,
    pub video: Option<VideoTrack>,
}

/// An active media call, provided by the peer-session library
pub trait MediaCall: Send + Sync {
    /// Swap the video track being sent to the remote peer
    fn replace_video_track(&self, track: &VideoTrack) -> Result<()>;

    fn close(&self);
}

#[derive(Default)]
pub struct MediaSessionState {
    local_stream: Option<MediaStream>,
    remote_stream: Option<MediaStream>,
    call: Option<Arc<dyn MediaCall>>,
    is_muted: bool,
    is_cam_off: bool,
    is_sharing: bool,
    original_video_track: Option<VideoTrack>,
}

impl MediaSessionState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_muted(&self) -> bool {
        self.is_muted
    }

    pub fn is_cam_off(&self) -> bool {
        self.is_cam_off
    }

    pub fn is_sharing(&self) -> bool {
        self.is_sharing
    }

    pub fn in_call(&self) -> bool {
        self.call.is_some()
    }

    pub fn local_stream(&self) -> Option<&MediaStream> {
        self.local_stream.as_ref()
    }

    pub fn remote_stream(&self) -> Option<&MediaStream> {
        self.remote_stream.as_ref()
    }

    /// The video track currently being sent, if any
    pub fn outgoing_video(&self) -> Option<&VideoTrack> {
        self.local_stream.as_ref().and_then(|s| s.video.as_ref())
    }

    /// Attach a call and the local stream it sends
    pub fn start_call(&mut self, call: Arc<dyn MediaCall>, local: MediaStream) {
        info!(stream = %local.id, "media call started");
        self.is_muted = !local.audio_enabled;
        self.is_cam_off = local.video.is_none();
        self.local_stream = Some(local);
        self.call = Some(call);
    }

    pub fn set_remote_stream(&mut self, remote: MediaStream) {
        self.remote_stream = Some(remote);
    }

    pub fn toggle_mute(&mut self) -> Result<bool> {
        let stream = self.local_stream.as_mut().ok_or(Error::NotConnected)?;
        self.is_muted = !self.is_muted;
        stream.audio_enabled = !self.is_muted;
        debug!(muted = self.is_muted, "toggled mute");
        Ok(self.is_muted)
    }

    pub fn toggle_camera(&mut self) -> Result<bool> {
        if self.local_stream.is_none() {
            return Err(Error::NotConnected);
        }
        self.is_cam_off = !self.is_cam_off;
        debug!(cam_off = self.is_cam_off, "toggled camera");
        Ok(self.is_cam_off)
    }

    /// Send `display` instead of the camera, remembering the camera track
    pub fn start_screen_share(&mut self, display: VideoTrack) -> Result<()> {
        if self.is_sharing {
            return Err(Error::Protocol("already sharing the screen".into()));
        }
        let call = self.call.clone().ok_or(Error::NotConnected)?;
        let stream = self.local_stream.as_mut().ok_or(Error::NotConnected)?;

        call.replace_video_track(&display)?;
        self.original_video_track = stream.video.replace(display);
        self.is_sharing = true;
        info!("screen share started");
        Ok(())
    }

    /// Put the camera track back
    pub fn stop_screen_share(&mut self) -> Result<()> {
        if !self.is_sharing {
            return Ok(());
        }
        let call = self.call.clone().ok_or(Error::NotConnected)?;
        let stream = self.local_stream.as_mut().ok_or(Error::NotConnected)?;

        let original = self.original_video_track.take();
        if let Some(track) = &original {
            call.replace_video_track(track)?;
        }
        stream.video = original;
        self.is_sharing = false;
        info!("screen share stopped");
        Ok(())
    }

    /// Release everything unconditionally. Safe to call repeatedly.
    pub fn teardown(&mut self) {
        if let Some(call) = self.call.take() {
            call.close();
            info!("media call torn down");
        }
        *self = Self::default();
    }
}
