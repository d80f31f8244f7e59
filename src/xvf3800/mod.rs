//! Access to the XMOS XVF3800 microphone-array DSP.
//!
//! The preferred path talks to the chip directly over USB vendor control
//! transfers ([`usb::UsbSource`]). [`MockSource`] stands in when no hardware
//! is attached (tests, `--mock`).

pub mod mock;
pub mod usb;

pub use mock::MockSource;
pub use usb::{UsbSource, UsbSourceConfig};

use std::sync::Arc;

use tracing::warn;

use crate::doa::DoaSource;
use crate::error::SourceError;

/// Open the best available DOA source: USB hardware, or an error if the
/// device is absent so the caller can decide what to do.
pub fn new_source(cfg: UsbSourceConfig) -> Result<Arc<dyn DoaSource>, SourceError> {
    let usb = UsbSource::open(cfg)?;
    Ok(Arc::new(usb))
}

/// Open the USB source, falling back to a mock when hardware is unavailable.
/// For development machines without the array attached.
pub fn new_source_with_fallback(cfg: UsbSourceConfig) -> Arc<dyn DoaSource> {
    match new_source(cfg) {
        Ok(source) => source,
        Err(e) => {
            warn!(error = %e, "USB source unavailable, using mock DOA source");
            Arc::new(MockSource::with_wave())
        }
    }
}
