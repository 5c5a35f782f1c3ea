//! USB transport layer for Airspy devices.
//!
//! [`Airspy`] wraps the rusb device handle and the vendor command set.
//! [`RusbBulkTransport`] serves the sample endpoint to a
//! [`StreamController`](crate::StreamController).

use std::collections::VecDeque;
use std::ffi::{c_int, c_void};
use std::ops::ControlFlow;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use libusb1_sys as ffi;
use rusb::{Context, Device, DeviceHandle, UsbContext};

use crate::error::{Error, Result};
use crate::queue::RawBuffer;
use crate::stream::{StreamController, StreamState};
use crate::transfer::{cancel_and_drain, BulkTransport, Completion, TransferStatus};
use crate::worker::{SampleBlock, SampleType};
use crate::{AIRSPY_PID, AIRSPY_VID};

/// Default timeout for USB control transfers.
/// Matches libairspy's LIBUSB_CTRL_TIMEOUT_MS constant.
const USB_TIMEOUT: Duration = Duration::from_millis(500);

/// Bulk IN endpoint carrying samples.
pub const SAMPLE_ENDPOINT: u8 = 0x81;

/// Vendor request, device to host.
const REQUEST_IN: u8 = 0xC0;
/// Vendor request, host to device.
const REQUEST_OUT: u8 = 0x40;

// Airspy command codes from libairspy
const AIRSPY_RECEIVER_MODE: u8 = 1;
const AIRSPY_BOARD_ID_READ: u8 = 9;
const AIRSPY_VERSION_STRING_READ: u8 = 10;
const AIRSPY_BOARD_PARTID_SERIALNO_READ: u8 = 11;
const AIRSPY_SET_SAMPLERATE: u8 = 12;
const AIRSPY_SET_FREQ: u8 = 13;
const AIRSPY_SET_LNA_GAIN: u8 = 14;
const AIRSPY_SET_MIXER_GAIN: u8 = 15;
const AIRSPY_SET_VGA_GAIN: u8 = 16;
const AIRSPY_SET_LNA_AGC: u8 = 17;
const AIRSPY_SET_MIXER_AGC: u8 = 18;
const AIRSPY_GPIO_WRITE: u8 = 21;
const AIRSPY_GET_SAMPLERATES: u8 = 25;
const AIRSPY_SET_PACKING: u8 = 26;

/// GPIO line driving the RF bias tee.
const RF_BIAS_PORT: u8 = 1;
const RF_BIAS_PIN: u8 = 13;

pub const LNA_GAIN_MAX: u8 = 14;
pub const MIXER_GAIN_MAX: u8 = 15;
pub const VGA_GAIN_MAX: u8 = 15;

/// Receiver mode command values.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum ReceiverMode {
    Off = 0,
    Rx = 1,
}

/// Device selector for Airspy devices
#[derive(Debug, Clone, PartialEq, Default)]
pub enum DeviceSelector {
    /// First device in enumeration order
    #[default]
    First,
    /// Select device by index (0 for first device)
    Index(usize),
    /// Select device by serial number
    Serial(u64),
}

/// Gain setting applied by [`Airspy::configure`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Gain {
    /// LNA and mixer AGC on, VGA at mid scale.
    #[default]
    Auto,
    /// AGC off, each stage set explicitly (values are clamped to the stage range).
    Manual { lna: u8, mixer: u8, vga: u8 },
}

/// Radio settings applied before streaming.
#[derive(Debug, Clone, PartialEq)]
pub struct AirspyConfig {
    pub device: DeviceSelector,
    /// Center frequency in Hz.
    pub center_freq: u32,
    /// Sample rate in Hz (must match one of the device's supported rates)
    pub sample_rate: u32,
    pub gain: Gain,
    /// Enable bias tee / RF bias (DC on antenna port)
    pub bias_tee: bool,
    /// Enable 12-bit sample packing (default: false = 16-bit samples)
    pub packing: bool,
    pub sample_type: SampleType,
}

impl AirspyConfig {
    pub fn new(center_freq: u32, sample_rate: u32) -> Self {
        Self {
            device: DeviceSelector::First,
            center_freq,
            sample_rate,
            gain: Gain::Auto,
            bias_tee: false,
            packing: false,
            sample_type: SampleType::Float32Iq,
        }
    }

    pub fn with_device(mut self, device: DeviceSelector) -> Self {
        self.device = device;
        self
    }

    pub fn with_gain(mut self, gain: Gain) -> Self {
        self.gain = gain;
        self
    }

    pub fn with_bias_tee(mut self, bias_tee: bool) -> Self {
        self.bias_tee = bias_tee;
        self
    }

    pub fn with_packing(mut self, packing: bool) -> Self {
        self.packing = packing;
        self
    }

    pub fn with_sample_type(mut self, sample_type: SampleType) -> Self {
        self.sample_type = sample_type;
        self
    }
}

/// Identification data read from a device.
#[derive(Debug, Clone, PartialEq)]
pub struct AirspyDeviceInfo {
    /// Board ID (0 = AIRSPY, 1 = AIRSPY MINI, etc.)
    pub board_id: u32,
    pub firmware_version: String,
    pub part_id: [u32; 2],
    pub serial_number: u64,
    /// Supported sample rates in Hz
    pub supported_sample_rates: Vec<u32>,
}

impl AirspyDeviceInfo {
    /// Get a human-readable board name
    pub fn board_name(&self) -> &'static str {
        match self.board_id {
            0 => "AIRSPY",
            1 => "AIRSPY MINI",
            2 => "AIRSPY HF+",
            _ => "AIRSPY (Unknown)",
        }
    }
}

/// GPIO address as the firmware expects it.
fn gpio_port_pin(port: u8, pin: u8) -> u16 {
    ((port as u16) << 5) | pin as u16
}

fn read_u32_le(bytes: &[u8]) -> u32 {
    u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]])
}

/// Decode the 24-byte part id / serial number record.
///
/// The serial is `serial_no[2]` (high word) and `serial_no[3]` (low word).
fn parse_partid_serialno(buf: &[u8]) -> Result<([u32; 2], u64)> {
    if buf.len() < 24 {
        return Err(Error::InvalidResponse(format!(
            "Board partid/serialno response incomplete: got {} bytes, expected 24",
            buf.len()
        )));
    }
    let part_id = [read_u32_le(&buf[0..4]), read_u32_le(&buf[4..8])];
    let high = read_u32_le(&buf[16..20]) as u64;
    let low = read_u32_le(&buf[20..24]) as u64;
    Ok((part_id, (high << 32) | low))
}

/// Airspy device handle.
pub struct Airspy {
    device: Arc<DeviceHandle<Context>>,
}

impl Airspy {
    /// Open the first available Airspy device.
    ///
    /// # Returns
    ///
    /// - `Ok(Airspy)` if a device was found and opened
    /// - `Err(Error::DeviceNotFound)` if no Airspy device is connected
    /// - `Err(Error::OpenFailed)` if the device could not be opened
    pub fn open_first() -> Result<Self> {
        Self::open_by_index(0)
    }

    /// Open a specific Airspy device by index (in order of enumeration).
    pub fn open_by_index(index: usize) -> Result<Self> {
        let context = Context::new()?;
        let device = airspy_devices(&context)?
            .into_iter()
            .nth(index)
            .ok_or(Error::DeviceNotFound)?;
        Self::open_device(&device)
    }

    /// Open the device whose serial number matches.
    pub fn open_by_serial(serial: u64) -> Result<Self> {
        let context = Context::new()?;
        for device in airspy_devices(&context)? {
            let airspy = match Self::open_device(&device) {
                Ok(airspy) => airspy,
                Err(e) => {
                    tracing::debug!("skipping device that failed to open: {}", e);
                    continue;
                }
            };
            if let Ok((_, found)) = airspy.board_partid_serialno() {
                if found == serial {
                    return Ok(airspy);
                }
            }
        }
        Err(Error::DeviceNotFound)
    }

    pub fn open(selector: &DeviceSelector) -> Result<Self> {
        match selector {
            DeviceSelector::First => Self::open_first(),
            DeviceSelector::Index(index) => Self::open_by_index(*index),
            DeviceSelector::Serial(serial) => Self::open_by_serial(*serial),
        }
    }

    /// List all available Airspy devices.
    pub fn list_devices() -> Result<Vec<String>> {
        let context = Context::new()?;
        Ok(airspy_devices(&context)?
            .iter()
            .map(|device| format!("Bus {:03} Device {:03}", device.bus_number(), device.address()))
            .collect())
    }

    /// Open a device handle.
    ///
    /// This follows the libairspy initialization sequence:
    /// 1. Open the USB device
    /// 2. Detach kernel driver (Linux only)
    /// 3. Set configuration to 1
    /// 4. Claim interface 0
    fn open_device(device: &Device<Context>) -> Result<Self> {
        let handle = device
            .open()
            .map_err(|e| Error::OpenFailed(e.to_string()))?;

        #[cfg(target_os = "linux")]
        {
            if handle.kernel_driver_active(0).unwrap_or(false) {
                tracing::debug!("Detaching kernel driver from interface 0");
                if let Err(e) = handle.detach_kernel_driver(0) {
                    tracing::warn!("Failed to detach kernel driver: {}", e);
                }
            }
        }

        if let Err(e) = handle.set_active_configuration(1) {
            tracing::debug!("Failed to set configuration (may already be set): {}", e);
        }

        handle
            .claim_interface(0)
            .map_err(|e| Error::OpenFailed(format!("claim interface 0: {}", e)))?;

        Ok(Airspy {
            device: Arc::new(handle),
        })
    }

    /// Get the firmware version string.
    ///
    /// # Returns
    ///
    /// A version string like "AirSpy MINI v1.0.0-rc10-0-g946184a 2016-09-19".
    pub fn version(&self) -> Result<String> {
        let mut buffer = [0u8; 128];
        let n = self.control_in(AIRSPY_VERSION_STRING_READ, 0, 0, &mut buffer)?;

        if n == 0 {
            return Err(Error::InvalidResponse("Version response empty".to_string()));
        }

        Ok(String::from_utf8_lossy(&buffer[..n])
            .trim_end_matches('\0')
            .to_string())
    }

    /// Get the board ID (e.g., 0 for AIRSPY, 1 for AIRSPY MINI).
    pub fn board_id(&self) -> Result<u32> {
        let mut buffer = [0u8; 4];
        let n = self.control_in(AIRSPY_BOARD_ID_READ, 0, 0, &mut buffer)?;

        match n {
            0 => Err(Error::InvalidResponse("Board ID response empty".to_string())),
            1..=3 => Ok(buffer[0] as u32),
            _ => Ok(read_u32_le(&buffer)),
        }
    }

    /// Get the part IDs and the 64-bit serial number.
    pub fn board_partid_serialno(&self) -> Result<([u32; 2], u64)> {
        let mut buffer = [0u8; 24];
        let n = self.control_in(AIRSPY_BOARD_PARTID_SERIALNO_READ, 0, 0, &mut buffer)?;
        tracing::trace!("board_partid_serialno buffer: {:02X?}", &buffer[..n]);
        parse_partid_serialno(&buffer[..n])
    }

    /// Get supported sample rates in Hz (e.g., [6000000, 3000000]).
    ///
    /// The firmware is asked for the count first, then for the list.
    pub fn supported_sample_rates(&self) -> Result<Vec<u32>> {
        let mut count_buffer = [0u8; 4];
        let n = self.control_in(AIRSPY_GET_SAMPLERATES, 0, 0, &mut count_buffer)?;
        if n < 4 {
            return Err(Error::InvalidResponse(
                "Sample rates count response empty".to_string(),
            ));
        }

        let count = read_u32_le(&count_buffer) as usize;
        if count == 0 {
            return Ok(Vec::new());
        }
        if count > 16 {
            return Err(Error::InvalidResponse(format!(
                "Sample rates count too large: {}",
                count
            )));
        }

        let mut rates_buffer = vec![0u8; count * 4];
        let n = self.control_in(AIRSPY_GET_SAMPLERATES, 0, count as u16, &mut rates_buffer)?;
        if n < count * 4 {
            return Err(Error::InvalidResponse(format!(
                "Sample rates response incomplete: expected {} rates, got {}",
                count,
                n / 4
            )));
        }

        Ok(rates_buffer.chunks_exact(4).map(read_u32_le).collect())
    }

    /// Read every identification field at once.
    pub fn device_info(&self) -> Result<AirspyDeviceInfo> {
        let (part_id, serial_number) = self.board_partid_serialno()?;
        Ok(AirspyDeviceInfo {
            board_id: self.board_id()?,
            firmware_version: self.version()?,
            part_id,
            serial_number,
            supported_sample_rates: self.supported_sample_rates()?,
        })
    }

    pub fn set_receiver_mode(&self, mode: ReceiverMode) -> Result<()> {
        self.control_out(AIRSPY_RECEIVER_MODE, mode as u16, 0, &[])?;
        Ok(())
    }

    /// Tune to `freq_hz`.
    pub fn set_freq(&self, freq_hz: u32) -> Result<()> {
        let n = self.control_out(AIRSPY_SET_FREQ, 0, 0, &freq_hz.to_le_bytes())?;
        if n < 4 {
            return Err(Error::InvalidResponse(format!(
                "set_freq accepted {} of 4 bytes",
                n
            )));
        }
        Ok(())
    }

    /// Select a sample rate by its index in [`supported_sample_rates`](Self::supported_sample_rates).
    pub fn set_sample_rate(&self, index: u8) -> Result<()> {
        self.command_with_retval(AIRSPY_SET_SAMPLERATE, index as u16)
    }

    /// Select a sample rate in Hz.
    pub fn set_sample_rate_hz(&self, rate: u32) -> Result<()> {
        let rates = self.supported_sample_rates()?;
        let index = rates.iter().position(|&r| r == rate).ok_or_else(|| {
            Error::invalid_param(format!(
                "Unsupported sample rate {} Hz. Available rates: {:?}",
                rate, rates
            ))
        })?;
        self.set_sample_rate(index as u8)
    }

    pub fn set_lna_gain(&self, gain: u8) -> Result<()> {
        self.command_with_retval(AIRSPY_SET_LNA_GAIN, gain.min(LNA_GAIN_MAX) as u16)
    }

    pub fn set_mixer_gain(&self, gain: u8) -> Result<()> {
        self.command_with_retval(AIRSPY_SET_MIXER_GAIN, gain.min(MIXER_GAIN_MAX) as u16)
    }

    pub fn set_vga_gain(&self, gain: u8) -> Result<()> {
        self.command_with_retval(AIRSPY_SET_VGA_GAIN, gain.min(VGA_GAIN_MAX) as u16)
    }

    pub fn set_lna_agc(&self, enabled: bool) -> Result<()> {
        self.command_with_retval(AIRSPY_SET_LNA_AGC, enabled as u16)
    }

    pub fn set_mixer_agc(&self, enabled: bool) -> Result<()> {
        self.command_with_retval(AIRSPY_SET_MIXER_AGC, enabled as u16)
    }

    pub fn gpio_write(&self, port: u8, pin: u8, value: bool) -> Result<()> {
        self.control_out(AIRSPY_GPIO_WRITE, value as u16, gpio_port_pin(port, pin), &[])?;
        Ok(())
    }

    /// Switch the bias tee on the antenna port.
    pub fn set_rf_bias(&self, enabled: bool) -> Result<()> {
        self.gpio_write(RF_BIAS_PORT, RF_BIAS_PIN, enabled)
    }

    /// Tell the firmware whether to send 12-bit packed samples.
    ///
    /// The matching [`StreamController::set_packing`] must be applied too.
    pub fn set_packing(&self, enabled: bool) -> Result<()> {
        self.command_with_retval(AIRSPY_SET_PACKING, enabled as u16)
    }

    /// Apply the radio part of `config` and mirror packing and sample type
    /// onto `stream`.
    pub fn configure(
        &self,
        config: &AirspyConfig,
        stream: &mut StreamController<RusbBulkTransport>,
    ) -> Result<()> {
        stream.set_packing(config.packing)?;
        stream.set_sample_type(config.sample_type)?;

        self.set_sample_rate_hz(config.sample_rate)?;
        self.set_freq(config.center_freq)?;
        match config.gain {
            Gain::Auto => {
                self.set_lna_agc(true)?;
                self.set_mixer_agc(true)?;
                self.set_vga_gain(8)?;
            }
            Gain::Manual { lna, mixer, vga } => {
                self.set_lna_agc(false)?;
                self.set_mixer_agc(false)?;
                self.set_lna_gain(lna)?;
                self.set_mixer_gain(mixer)?;
                self.set_vga_gain(vga)?;
            }
        }
        self.set_rf_bias(config.bias_tee)?;
        self.set_packing(config.packing)?;

        tracing::debug!(
            freq = config.center_freq,
            rate = config.sample_rate,
            gain = ?config.gain,
            "device configured"
        );
        Ok(())
    }

    /// Bulk transport over this device's sample endpoint.
    pub fn bulk_transport(&self) -> RusbBulkTransport {
        RusbBulkTransport::new(Arc::clone(&self.device), SAMPLE_ENDPOINT)
    }

    /// Turn the receiver on and start `stream`.
    pub fn start_rx<F>(&self, stream: &mut StreamController<RusbBulkTransport>, callback: F) -> Result<()>
    where
        F: FnMut(&SampleBlock<'_>) -> ControlFlow<()> + Send + 'static,
    {
        if stream.state() != StreamState::Idle {
            return Err(Error::Busy);
        }
        if let Err(e) = self.device.clear_halt(SAMPLE_ENDPOINT) {
            tracing::debug!("clear_halt on sample endpoint failed: {}", e);
        }
        self.set_receiver_mode(ReceiverMode::Rx)?;
        if let Err(e) = stream.start(callback) {
            let _ = self.set_receiver_mode(ReceiverMode::Off);
            return Err(e);
        }
        Ok(())
    }

    /// Stop `stream` and turn the receiver off.
    pub fn stop_rx(&self, stream: &mut StreamController<RusbBulkTransport>) -> Result<()> {
        let stopped = stream.stop();
        self.set_receiver_mode(ReceiverMode::Off)?;
        stopped
    }

    /// Vendor IN request answered with a single status byte.
    fn command_with_retval(&self, request: u8, index: u16) -> Result<()> {
        let mut retval = [0u8; 1];
        let n = self.control_in(request, 0, index, &mut retval)?;
        if n < 1 {
            return Err(Error::InvalidResponse(format!(
                "command {} returned no status byte",
                request
            )));
        }
        Ok(())
    }

    /// Perform a control IN transfer.
    fn control_in(&self, request: u8, value: u16, index: u16, buf: &mut [u8]) -> Result<usize> {
        self.device
            .read_control(REQUEST_IN, request, value, index, buf, USB_TIMEOUT)
            .map_err(|e| {
                tracing::debug!(
                    "Control IN transfer failed: req={}, val={}, idx={}, error={}",
                    request,
                    value,
                    index,
                    e
                );
                Error::ControlTransferFailed(e.to_string())
            })
    }

    /// Perform a control OUT transfer.
    fn control_out(&self, request: u8, value: u16, index: u16, buf: &[u8]) -> Result<usize> {
        self.device
            .write_control(REQUEST_OUT, request, value, index, buf, USB_TIMEOUT)
            .map_err(|e| {
                tracing::debug!(
                    "Control OUT transfer failed: req={}, val={}, idx={}, error={}",
                    request,
                    value,
                    index,
                    e
                );
                Error::ControlTransferFailed(e.to_string())
            })
    }
}

impl Drop for Airspy {
    /// Transports handed out by [`Airspy::bulk_transport`] stop working once
    /// the interface is released, so stop their streams first.
    fn drop(&mut self) {
        // Without releasing the interface the device stays unavailable until a USB reset.
        if let Err(e) = self.device.release_interface(0) {
            tracing::debug!("Failed to release USB interface: {}", e);
        }
        tracing::debug!("Airspy device cleaned up");
    }
}

/// Airspy devices on the bus, in enumeration order.
fn airspy_devices(context: &Context) -> Result<Vec<Device<Context>>> {
    let mut found = Vec::new();
    for device in context.devices()?.iter() {
        let desc = device.device_descriptor()?;
        if desc.vendor_id() == AIRSPY_VID && desc.product_id() == AIRSPY_PID {
            found.push(device);
        }
    }
    Ok(found)
}

/// [`BulkTransport`] over libusb asynchronous bulk transfers.
///
/// Every submitted buffer becomes a libusb transfer queued on the endpoint,
/// so the whole pool stays in flight at the USB level. Completions are
/// collected by [`handle_events`](BulkTransport::handle_events), which pumps
/// the libusb context of the device and reports finished transfers in
/// submission order.
pub struct RusbBulkTransport {
    device: Arc<DeviceHandle<Context>>,
    context: Context,
    endpoint: u8,
    in_flight: VecDeque<UsbTransfer>,
    idle: Vec<UsbTransfer>,
}

impl RusbBulkTransport {
    pub fn new(device: Arc<DeviceHandle<Context>>, endpoint: u8) -> Self {
        let context = device.context().clone();
        Self {
            device,
            context,
            endpoint,
            in_flight: VecDeque::new(),
            idle: Vec::new(),
        }
    }
}

impl BulkTransport for RusbBulkTransport {
    fn submit(&mut self, mut buffer: RawBuffer) -> Result<()> {
        let length = c_int::try_from(buffer.capacity())
            .map_err(|_| Error::invalid_param("transfer buffer too large"))?;
        let mut transfer = match self.idle.pop() {
            Some(transfer) => transfer,
            None => UsbTransfer::alloc()?,
        };
        transfer.done.store(false, Ordering::Release);

        // SAFETY: the transfer and its completion flag are owned by `transfer`
        // and the buffer's heap storage is owned by `buffer`; both are kept in
        // `in_flight` until libusb reports the transfer finished.
        let rc = unsafe {
            ffi::libusb_fill_bulk_transfer(
                transfer.raw.as_ptr(),
                self.device.as_raw(),
                self.endpoint,
                buffer.as_mut_capacity().as_mut_ptr(),
                length,
                transfer_callback,
                transfer.user_data(),
                0,
            );
            ffi::libusb_submit_transfer(transfer.raw.as_ptr())
        };
        if rc != 0 {
            self.idle.push(transfer);
            return Err(Error::StreamingError(format!(
                "libusb_submit_transfer failed for buffer {}: {}",
                buffer.id(),
                rc
            )));
        }

        transfer.buffer = Some(buffer);
        self.in_flight.push_back(transfer);
        Ok(())
    }

    fn cancel_all(&mut self) {
        for transfer in &self.in_flight {
            // SAFETY: the transfer is submitted and not yet reported.
            let rc = unsafe { ffi::libusb_cancel_transfer(transfer.raw.as_ptr()) };
            if rc != 0 && rc != ffi::constants::LIBUSB_ERROR_NOT_FOUND {
                tracing::debug!("libusb_cancel_transfer failed: {}", rc);
            }
        }
    }

    fn in_flight(&self) -> usize {
        self.in_flight.len()
    }

    fn handle_events(&mut self, timeout: Duration, completions: &mut Vec<Completion>) -> Result<()> {
        match self.context.handle_events(Some(timeout)) {
            Ok(()) | Err(rusb::Error::Interrupted) => {}
            Err(e) => {
                return Err(Error::StreamingError(format!(
                    "libusb event handling failed: {}",
                    e
                )))
            }
        }

        let mut still_pending = VecDeque::with_capacity(self.in_flight.len());
        for mut transfer in std::mem::take(&mut self.in_flight) {
            if !transfer.done.load(Ordering::Acquire) {
                still_pending.push_back(transfer);
                continue;
            }
            // SAFETY: libusb no longer touches a transfer after its callback ran.
            let (code, actual) = unsafe {
                let raw = transfer.raw.as_ref();
                (raw.status, raw.actual_length)
            };
            if let Some(mut buffer) = transfer.buffer.take() {
                let status = completion_status(code);
                match status {
                    TransferStatus::Completed => buffer.set_len(actual.max(0) as usize),
                    TransferStatus::Cancelled => buffer.set_len(0),
                    TransferStatus::Error => {
                        tracing::warn!(
                            "bulk transfer on endpoint {:#04x} failed with status {}",
                            self.endpoint,
                            status_name(code)
                        );
                        buffer.set_len(0);
                    }
                }
                completions.push(Completion::new(buffer, status));
            }
            self.idle.push(transfer);
        }
        self.in_flight = still_pending;
        Ok(())
    }
}

impl Drop for RusbBulkTransport {
    fn drop(&mut self) {
        if self.in_flight.is_empty() {
            return;
        }
        cancel_and_drain(self, USB_TIMEOUT);
        if !self.in_flight.is_empty() {
            // Freeing a submitted transfer is undefined behavior in libusb
            tracing::warn!(
                "leaking {} USB transfers still owned by libusb",
                self.in_flight.len()
            );
            for transfer in self.in_flight.drain(..) {
                std::mem::forget(transfer);
            }
        }
    }
}

/// Map a libusb transfer status onto a completion status.
fn completion_status(status: c_int) -> TransferStatus {
    match status {
        ffi::constants::LIBUSB_TRANSFER_COMPLETED => TransferStatus::Completed,
        ffi::constants::LIBUSB_TRANSFER_CANCELLED => TransferStatus::Cancelled,
        _ => TransferStatus::Error,
    }
}

fn status_name(status: c_int) -> &'static str {
    match status {
        ffi::constants::LIBUSB_TRANSFER_ERROR => "error",
        ffi::constants::LIBUSB_TRANSFER_TIMED_OUT => "timed out",
        ffi::constants::LIBUSB_TRANSFER_STALL => "stall",
        ffi::constants::LIBUSB_TRANSFER_NO_DEVICE => "no device",
        ffi::constants::LIBUSB_TRANSFER_OVERFLOW => "overflow",
        _ => "unknown",
    }
}

/// One libusb transfer, reused across submissions.
struct UsbTransfer {
    raw: NonNull<ffi::libusb_transfer>,
    /// Set by [`transfer_callback`]. Boxed so its address survives moves.
    done: Box<AtomicBool>,
    buffer: Option<RawBuffer>,
}

// SAFETY: the transfer is only touched by the thread that owns the transport,
// and libusb allows transfers to be submitted and reaped from any thread.
unsafe impl Send for UsbTransfer {}

impl UsbTransfer {
    fn alloc() -> Result<Self> {
        // SAFETY: plain allocation, checked for null below.
        let raw = unsafe { ffi::libusb_alloc_transfer(0) };
        let raw = NonNull::new(raw).ok_or(Error::NoMemory("USB transfer"))?;
        Ok(Self {
            raw,
            done: Box::new(AtomicBool::new(false)),
            buffer: None,
        })
    }

    fn user_data(&self) -> *mut c_void {
        &*self.done as *const AtomicBool as *mut c_void
    }
}

impl Drop for UsbTransfer {
    fn drop(&mut self) {
        // SAFETY: in-flight transfers are forgotten, never dropped.
        unsafe { ffi::libusb_free_transfer(self.raw.as_ptr()) }
    }
}

extern "system" fn transfer_callback(transfer: *mut ffi::libusb_transfer) {
    // SAFETY: `user_data` points at the completion flag of the owning
    // `UsbTransfer`, which outlives the submission.
    unsafe {
        let done = (*transfer).user_data as *const AtomicBool;
        (*done).store(true, Ordering::Release);
    }
}
