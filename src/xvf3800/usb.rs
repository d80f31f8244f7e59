//! Direct USB access to the XVF3800 DSP.
//!
//! The chip exposes its control parameters over vendor control transfers:
//! request type IN | Vendor | Device, wValue = 0x80 | command id, wIndex =
//! resource id. Every response leads with a status byte that must be zero.
//!
//! Health model: consecutive read failures degrade the source; at
//! `max_consecutive_errors` the handle is dropped and the next read goes
//! through a backoff-gated reopen. A single success resets both the error
//! count and the backoff.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use byteorder::{ByteOrder, LittleEndian};
use chrono::Utc;
use rusb::{Direction, GlobalContext, Recipient, RequestType};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::doa::{self, DoaSource, Reading, MIC_COUNT};
use crate::error::SourceError;

/// XVF3800 USB identifiers.
pub const VENDOR_ID: u16 = 0x38FB;
pub const PRODUCT_ID: u16 = 0x1001;

// Resource and command ids from the XVF3800 control command set.
const GPO_RESID: u16 = 20;
const DOA_CMD_ID: u16 = 19; // DOA_VALUE_RADIANS: angle + speech flag
const AEC_RESID: u16 = 33;
const AEC_AZIMUTH_CMD_ID: u16 = 75; // AEC_AZIMUTH_VALUES: 4 floats
const AEC_SPENERGY_CMD_ID: u16 = 80; // AEC_SPENERGY_VALUES: 4 floats

/// Read flag OR'ed into wValue.
const READ_FLAG: u16 = 0x80;

/// status byte + 2 × f32
const DOA_FRAME_LEN: usize = 9;
/// status byte + 4 × f32
const VECTOR_FRAME_LEN: usize = 17;

const CONTROL_TIMEOUT: Duration = Duration::from_millis(500);

#[derive(Debug, Clone)]
pub struct UsbSourceConfig {
    pub max_consecutive_errors: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

impl Default for UsbSourceConfig {
    fn default() -> Self {
        Self {
            max_consecutive_errors: 5,
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_secs(5),
        }
    }
}

type Handle = rusb::DeviceHandle<GlobalContext>;

struct UsbState {
    handle: Option<Handle>,
    closed: bool,
    consecutive_errors: u32,
    backoff: Duration,
}

/// USB-attached DOA source. All device operations are serialized under one
/// async mutex; the backoff sleep inside reconnection honours cancellation.
pub struct UsbSource {
    cfg: UsbSourceConfig,
    inner: Mutex<UsbState>,
    // Mirror of the health flag, readable without the device lock.
    healthy: AtomicBool,
}

impl UsbSource {
    /// Find and open the DSP. Fails when the device is not attached.
    pub fn open(cfg: UsbSourceConfig) -> Result<Self, SourceError> {
        let handle = open_device()?;

        info!("USB DOA source initialized (VID=0x{VENDOR_ID:04X} PID=0x{PRODUCT_ID:04X})");

        Ok(Self {
            inner: Mutex::new(UsbState {
                handle: Some(handle),
                closed: false,
                consecutive_errors: 0,
                backoff: cfg.initial_backoff,
            }),
            cfg,
            healthy: AtomicBool::new(true),
        })
    }

    /// A source with no device handle, starting from the reconnect path.
    #[cfg(test)]
    fn disconnected(cfg: UsbSourceConfig) -> Self {
        Self {
            inner: Mutex::new(UsbState {
                handle: None,
                closed: false,
                consecutive_errors: 0,
                backoff: cfg.initial_backoff,
            }),
            cfg,
            healthy: AtomicBool::new(true),
        }
    }

    /// One failed device operation. At the threshold the handle is dropped so
    /// the next read reopens the device.
    fn record_error(&self, state: &mut UsbState, error: &str) {
        state.consecutive_errors += 1;

        if state.consecutive_errors >= self.cfg.max_consecutive_errors {
            self.healthy.store(false, Ordering::Relaxed);
            warn!(
                consecutive_errors = state.consecutive_errors,
                last_error = error,
                "USB source marked unhealthy, will attempt reconnect"
            );
            state.handle = None;
        }
    }

    fn record_success(&self, state: &mut UsbState) {
        if state.consecutive_errors > 0 {
            info!(
                previous_errors = state.consecutive_errors,
                "USB source recovered"
            );
        }
        state.consecutive_errors = 0;
        state.backoff = self.cfg.initial_backoff;
        self.healthy.store(true, Ordering::Relaxed);
    }

    /// Backoff-gated reopen. Sleeps the current backoff (interruptible), then
    /// doubles it up to the cap and tries to open the device again.
    async fn reconnect(
        &self,
        state: &mut UsbState,
        cancel: &CancellationToken,
    ) -> Result<(), SourceError> {
        info!(backoff_ms = state.backoff.as_millis() as u64, "attempting USB reconnect");

        tokio::select! {
            _ = cancel.cancelled() => return Err(SourceError::Cancelled),
            _ = tokio::time::sleep(state.backoff) => {}
        }

        state.backoff = (state.backoff * 2).min(self.cfg.max_backoff);

        match open_device() {
            Ok(handle) => {
                state.handle = Some(handle);
                state.consecutive_errors = 0;
                self.healthy.store(true, Ordering::Relaxed);
                info!("USB reconnect successful");
                Ok(())
            }
            Err(e) => {
                warn!(error = %e, "USB reconnect failed");
                Err(e)
            }
        }
    }

    /// Best-effort enhanced reads. A failure in either read zero-fills that
    /// vector and never fails the primary read; the two reads are
    /// independent of each other.
    fn read_enhanced(handle: &Handle) -> ([f64; MIC_COUNT], [f64; MIC_COUNT]) {
        let energy = read_vector(handle, AEC_RESID, AEC_SPENERGY_CMD_ID).unwrap_or_default();
        let azimuths = read_vector(handle, AEC_RESID, AEC_AZIMUTH_CMD_ID).unwrap_or_default();
        (energy, azimuths)
    }
}

#[async_trait]
impl DoaSource for UsbSource {
    async fn get_doa(&self, cancel: &CancellationToken) -> Result<Reading, SourceError> {
        let mut state = self.inner.lock().await;

        if state.closed {
            return Err(SourceError::Closed);
        }

        if state.handle.is_none() {
            self.reconnect(&mut state, cancel).await?;
        }

        let start = Instant::now();
        let mut buf = [0u8; DOA_FRAME_LEN];

        let read = match state.handle.as_ref() {
            Some(handle) => handle.read_control(
                rusb::request_type(Direction::In, RequestType::Vendor, Recipient::Device),
                0,
                READ_FLAG | DOA_CMD_ID,
                GPO_RESID,
                &mut buf,
                CONTROL_TIMEOUT,
            ),
            None => return Err(SourceError::Transient("device handle unavailable".into())),
        };

        let n = match read {
            Ok(n) => n,
            Err(e) => {
                let msg = format!("USB control transfer failed: {e}");
                self.record_error(&mut state, &msg);
                return Err(SourceError::Transient(msg));
            }
        };

        let (raw_angle, speaking) = match parse_doa_frame(&buf[..n]) {
            Ok(parsed) => parsed,
            Err(e) => {
                self.record_error(&mut state, &e.to_string());
                return Err(e);
            }
        };

        self.record_success(&mut state);

        let latency = start.elapsed();
        let (speech_energy, mic_azimuths) = match state.handle.as_ref() {
            Some(handle) => Self::read_enhanced(handle),
            None => ([0.0; MIC_COUNT], [0.0; MIC_COUNT]),
        };

        Ok(Reading {
            angle: doa::to_normalized(raw_angle),
            raw_angle,
            speaking,
            timestamp: Utc::now(),
            latency_ms: latency.as_millis() as i64,
            speech_energy,
            mic_azimuths,
            total_energy: speech_energy.iter().sum(),
        })
    }

    fn healthy(&self) -> bool {
        self.healthy.load(Ordering::Relaxed)
    }

    fn name(&self) -> &'static str {
        "usb"
    }

    async fn close(&self) -> Result<(), SourceError> {
        let mut state = self.inner.lock().await;

        if state.closed {
            return Ok(());
        }

        state.closed = true;
        state.handle = None;
        info!("USB source closed");

        Ok(())
    }
}

fn open_device() -> Result<Handle, SourceError> {
    let handle = rusb::open_device_with_vid_pid(VENDOR_ID, PRODUCT_ID).ok_or_else(|| {
        SourceError::Transient(format!(
            "XVF3800 not found (VID=0x{VENDOR_ID:04X} PID=0x{PRODUCT_ID:04X})"
        ))
    })?;

    // Non-fatal: some platforms have no kernel driver to detach.
    if let Err(e) = handle.set_auto_detach_kernel_driver(true) {
        debug!(error = %e, "auto-detach kernel driver failed");
    }

    Ok(handle)
}

/// Parse the 9-byte DOA_VALUE_RADIANS response: status, angle f32, speech f32.
fn parse_doa_frame(buf: &[u8]) -> Result<(f64, bool), SourceError> {
    if buf.len() < DOA_FRAME_LEN {
        return Err(SourceError::Protocol(format!(
            "short read: got {} bytes, expected {DOA_FRAME_LEN}",
            buf.len()
        )));
    }

    if buf[0] != 0 {
        return Err(SourceError::Protocol(format!(
            "device returned error status: {}",
            buf[0]
        )));
    }

    let raw_angle = LittleEndian::read_f32(&buf[1..5]) as f64;
    let speaking = LittleEndian::read_f32(&buf[5..9]) != 0.0;

    Ok((raw_angle, speaking))
}

/// Parse a 17-byte four-float response. `None` on short reads or a non-zero
/// status byte; the caller zero-fills.
fn parse_vector_frame(buf: &[u8]) -> Option<[f64; MIC_COUNT]> {
    if buf.len() < VECTOR_FRAME_LEN || buf[0] != 0 {
        return None;
    }

    let mut values = [0.0; MIC_COUNT];
    for (i, value) in values.iter_mut().enumerate() {
        *value = LittleEndian::read_f32(&buf[1 + i * 4..5 + i * 4]) as f64;
    }
    Some(values)
}

fn read_vector(handle: &Handle, resid: u16, cmd_id: u16) -> Option<[f64; MIC_COUNT]> {
    let mut buf = [0u8; VECTOR_FRAME_LEN];
    let n = handle
        .read_control(
            rusb::request_type(Direction::In, RequestType::Vendor, Recipient::Device),
            0,
            READ_FLAG | cmd_id,
            resid,
            &mut buf,
            CONTROL_TIMEOUT,
        )
        .ok()?;

    parse_vector_frame(&buf[..n])
}
