//! BIDS JSON sidecars.

use std::fs;
use std::io::ErrorKind;

use camino::Utf8Path;
use serde::Deserialize;

use crate::error::SidecarError;

/// Echo time in seconds used when the sidecar is absent.
pub const DEFAULT_ECHO_TIME: f64 = 0.001;
/// Field strength in tesla used when the sidecar is absent.
pub const DEFAULT_FIELD_STRENGTH: f64 = 7.0;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct Sidecar {
    echo_time: f64,
    magnetic_field_strength: f64,
}

/// Reads `EchoTime` and `MagneticFieldStrength` from the sidecar at `path`.
///
/// A missing file yields the defaults; an unreadable file or one without
/// both fields is an error.
pub fn read_sidecar(path: &Utf8Path) -> Result<(f64, f64), SidecarError> {
    let text = match fs::read_to_string(path) {
        Ok(text) => text,
        Err(err) if err.kind() == ErrorKind::NotFound => {
            tracing::debug!(%path, "no sidecar, using defaults");
            return Ok((DEFAULT_ECHO_TIME, DEFAULT_FIELD_STRENGTH));
        }
        Err(err) => return Err(err.into()),
    };

    let sidecar: Sidecar = serde_json::from_str(&text)?;
    Ok((sidecar.echo_time, sidecar.magnetic_field_strength))
}
