use crate::store::SqliteIdentityStore;
use clockface_core::{Coordinate, Frame, VerificationPipeline, VerifyError};
use std::sync::Arc;
use zbus::interface;
use zbus::object_server::SignalEmitter;

pub const BUS_NAME: &str = "org.clockface.Attendance1";
pub const OBJECT_PATH: &str = "/org/clockface/Attendance1";

/// D-Bus interface for the Clockface attendance daemon.
///
/// Bus name: org.clockface.Attendance1
/// Object path: /org/clockface/Attendance1
pub struct AttendanceService {
    pipeline: Arc<VerificationPipeline>,
    store: Arc<SqliteIdentityStore>,
}

impl AttendanceService {
    pub fn new(pipeline: Arc<VerificationPipeline>, store: Arc<SqliteIdentityStore>) -> Self {
        Self { pipeline, store }
    }
}

#[interface(name = "org.clockface.Attendance1")]
impl AttendanceService {
    /// Verify attendance from a burst of encoded frames taken at the given
    /// GPS fix. Returns the outcome as JSON; a failed verdict is not an error.
    async fn verify(
        &self,
        identity: &str,
        frames: Vec<Vec<u8>>,
        latitude: f64,
        longitude: f64,
    ) -> zbus::fdo::Result<String> {
        tracing::info!(identity, frames = frames.len(), "verify requested");
        let frames = decode_frames(frames, self.pipeline.min_valid_frames())?;
        let outcome = self
            .pipeline
            .verify_frames(frames, identity, Coordinate::new(latitude, longitude))
            .await
            .map_err(to_fdo)?;
        to_json(&outcome)
    }

    /// Register a reference embedding from several poses. Replaces any
    /// existing registration and evicts the cached copy.
    async fn register(&self, identity: &str, frames: Vec<Vec<u8>>) -> zbus::fdo::Result<String> {
        tracing::info!(identity, frames = frames.len(), "register requested");
        let frames = decode_frames(frames, self.pipeline.min_valid_frames())?;
        let outcome = self
            .pipeline
            .register_frames(frames, identity)
            .await
            .map_err(to_fdo)?;

        let record = self
            .store
            .save(identity, &outcome.embedding)
            .await
            .map_err(|e| zbus::fdo::Error::Failed(e.to_string()))?;
        self.pipeline.cache().invalidate(identity);

        to_json(&serde_json::json!({
            "attempt_id": outcome.attempt_id,
            "identity_id": record.identity_id,
            "registered_at": record.registered_at,
            "valid_frames": outcome.valid_frames,
            "poses": outcome.poses,
        }))
    }

    /// Drop the cached reference for `identity`. Returns whether one was cached.
    async fn invalidate(&self, identity: &str) -> bool {
        let evicted = self.pipeline.cache().invalidate(identity);
        tracing::info!(identity, evicted, "cache invalidation requested");
        evicted
    }

    /// Remove a registration entirely.
    async fn remove(&self, identity: &str) -> zbus::fdo::Result<bool> {
        let removed = self
            .store
            .remove(identity)
            .await
            .map_err(|e| zbus::fdo::Error::Failed(e.to_string()))?;
        self.pipeline.cache().invalidate(identity);
        tracing::info!(identity, removed, "registration removed");
        Ok(removed)
    }

    /// Return daemon status information.
    async fn status(&self) -> zbus::fdo::Result<String> {
        let admission = self.pipeline.admission();
        let registered = self
            .store
            .count()
            .await
            .map_err(|e| zbus::fdo::Error::Failed(e.to_string()))?;
        Ok(serde_json::json!({
            "version": env!("CARGO_PKG_VERSION"),
            "in_flight": admission.in_flight(),
            "max_concurrent": admission.max_concurrent(),
            "cached_identities": self.pipeline.cache().len(),
            "registered_identities": registered,
            "geofence_radius_m": self.pipeline.geofence().radius_m,
        })
        .to_string())
    }

    /// Pipeline progress, one JSON-encoded event per signal.
    #[zbus(signal)]
    pub async fn progress(emitter: &SignalEmitter<'_>, event: &str) -> zbus::Result<()>;
}

/// Read every frame's dimensions. A frame that does not decode is kept with
/// zero dimensions so the pipeline records it as a faulted frame; the call is
/// only refused when too few decodable frames remain to ever pass.
fn decode_frames(frames: Vec<Vec<u8>>, required: usize) -> zbus::fdo::Result<Vec<Frame>> {
    let mut decodable = 0usize;
    let frames: Vec<Frame> = frames
        .into_iter()
        .enumerate()
        .map(|(i, data)| match Frame::read_dimensions(&data) {
            Ok((width, height)) => {
                decodable += 1;
                Frame::new(data, width, height)
            }
            Err(e) => {
                tracing::warn!(frame = i, error = %e, "undecodable frame");
                Frame::new(data, 0, 0)
            }
        })
        .collect();

    if decodable < required {
        return Err(zbus::fdo::Error::InvalidArgs(format!(
            "only {decodable} of {} frames decodable, need at least {required}",
            frames.len()
        )));
    }
    Ok(frames)
}

fn to_fdo(err: VerifyError) -> zbus::fdo::Error {
    let message = match err.reason() {
        Some(reason) => format!("{reason:?}: {err}"),
        None => err.to_string(),
    };
    match err {
        VerifyError::Validation(_) => zbus::fdo::Error::InvalidArgs(message),
        VerifyError::Capacity(_) => zbus::fdo::Error::LimitsExceeded(message),
        VerifyError::Store(_) => zbus::fdo::Error::Failed(message),
    }
}

fn to_json<T: serde::Serialize>(value: &T) -> zbus::fdo::Result<String> {
    serde_json::to_string(value).map_err(|e| zbus::fdo::Error::Failed(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use clockface_core::{CapacityError, ValidationError};

    #[test]
    fn test_capacity_maps_to_limits_exceeded() {
        let err = to_fdo(VerifyError::Capacity(CapacityError::Busy { max_concurrent: 5 }));
        match err {
            zbus::fdo::Error::LimitsExceeded(msg) => assert!(msg.starts_with("AdmissionRejected")),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_validation_maps_to_invalid_args() {
        let err = to_fdo(VerifyError::Validation(ValidationError::EmptyIdentity));
        assert!(matches!(err, zbus::fdo::Error::InvalidArgs(_)));
    }

    fn png() -> Vec<u8> {
        let mut out = Vec::new();
        image::RgbImage::new(64, 48)
            .write_to(&mut std::io::Cursor::new(&mut out), image::ImageFormat::Png)
            .unwrap();
        out
    }

    #[test]
    fn test_undecodable_frame_is_kept_as_faulted() {
        let frames = decode_frames(vec![png(), b"garbage".to_vec(), png(), png()], 2).unwrap();
        assert_eq!(frames.len(), 4);
        assert_eq!((frames[0].width, frames[0].height), (64, 48));
        assert_eq!((frames[1].width, frames[1].height), (0, 0));
        assert_eq!(frames[1].data, b"garbage");
        assert_eq!(frames[3].width, 64);
    }

    #[test]
    fn test_too_few_decodable_frames_is_invalid_args() {
        let err = decode_frames(vec![png(), b"garbage".to_vec(), Vec::new()], 2).unwrap_err();
        match err {
            zbus::fdo::Error::InvalidArgs(msg) => assert!(msg.contains("only 1 of 3")),
            other => panic!("unexpected {other:?}"),
        }
    }
}
