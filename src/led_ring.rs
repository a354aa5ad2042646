//! ReSpeaker USB LED ring as an actuator backend.
//!
//! The ring has no separate pins, so the four logical channels are mixed into
//! one colour: red, green and blue as themselves, the accent as amber scaled by
//! its duty. The capture indicator shows as a dim white while nothing else is
//! lit.

use crate::actuator::{Channel, OutputBackend, Pin};
use crate::error::{EdgeError, Result};
use strum::EnumCount;

/// Accent colour at full duty
const ACCENT_RGB: (u8, u8, u8) = (255, 140, 0);
/// Capture indicator colour
const CAPTURE_RGB: (u8, u8, u8) = (16, 16, 16);
/// Ring brightness (0-31)
const RING_BRIGHTNESS: u8 = 20;

#[cfg(feature = "led_ring")]
mod led_ring_impl {
    use rusb::UsbContext;
    use std::time::Duration;
    use thiserror::Error;

    /// ReSpeaker USB device identifiers
    const RESPEAKER_VID: u16 = 0x2886; // SEEED vendor ID
    const RESPEAKER_4MIC_PID: u16 = 0x0018; // ReSpeaker 4-Mic Array product ID

    const CTRL_OUT: u8 = 0x00;
    const CTRL_TYPE_VENDOR: u8 = 0x40;
    const CTRL_RECIPIENT_DEVICE: u8 = 0x00;
    const USB_REQUEST: u8 = 0;
    const USB_VALUE_INDEX: u16 = 0x1C;
    const USB_TIMEOUT: Duration = Duration::from_millis(1000);

    /// LED ring commands
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub enum LedCommand {
        /// Set all LEDs to a single color
        Mono { red: u8, green: u8, blue: u8 },
        /// Set brightness (0-31)
        SetBrightness { brightness: u8 },
    }

    #[derive(Error, Debug)]
    pub enum LedRingError {
        #[error("Failed to initialize USB context: {0}")]
        UsbInit(rusb::Error),
        #[error("ReSpeaker device not found")]
        DeviceNotFound,
        #[error("Failed to open device: {0}")]
        DeviceOpen(rusb::Error),
        #[error("Failed to send command: {0}")]
        CommandFailed(rusb::Error),
        #[error("Invalid brightness value: {0} (must be 0-31)")]
        InvalidBrightness(u8),
    }

    /// Controller for ReSpeaker LED ring using direct USB control transfers
    pub struct LedRing {
        device_handle: rusb::DeviceHandle<rusb::Context>,
        _context: rusb::Context,
    }

    impl LedRing {
        pub fn new() -> Result<Self, LedRingError> {
            let context = rusb::Context::new().map_err(LedRingError::UsbInit)?;
            let devices = context.devices().map_err(LedRingError::UsbInit)?;

            for device in devices.iter() {
                let device_desc = device.device_descriptor().map_err(LedRingError::UsbInit)?;

                if device_desc.vendor_id() == RESPEAKER_VID
                    && device_desc.product_id() == RESPEAKER_4MIC_PID
                {
                    let device_handle = device.open().map_err(LedRingError::DeviceOpen)?;

                    // Interface 3 is often held by the kernel's audio driver.
                    if let Err(e) = device_handle.claim_interface(3) {
                        log::warn!(
                            "Could not claim interface 3: {}. LED control may still work.",
                            e
                        );
                    }

                    log::info!("ReSpeaker USB 4-Mic Array found and opened successfully");

                    return Ok(LedRing {
                        device_handle,
                        _context: context,
                    });
                }
            }

            Err(LedRingError::DeviceNotFound)
        }

        /// Send a command to the LED ring using a vendor control transfer
        pub fn send_command(&self, command: LedCommand) -> Result<(), LedRingError> {
            let (cmd_value, data) = match command {
                LedCommand::Mono { red, green, blue } => (1, vec![red, green, blue, 0]),
                LedCommand::SetBrightness { brightness } => {
                    if brightness > 31 {
                        return Err(LedRingError::InvalidBrightness(brightness));
                    }
                    (0x20, vec![brightness])
                }
            };

            let request_type = CTRL_OUT | CTRL_TYPE_VENDOR | CTRL_RECIPIENT_DEVICE;
            match self.device_handle.write_control(
                request_type,
                USB_REQUEST,
                cmd_value,
                USB_VALUE_INDEX,
                &data,
                USB_TIMEOUT,
            ) {
                Ok(bytes_written) => {
                    log::debug!(
                        "LED command {} sent successfully ({} bytes)",
                        cmd_value,
                        bytes_written
                    );
                    Ok(())
                }
                Err(e) => {
                    log::error!("Failed to send LED command {}: {}", cmd_value, e);
                    Err(LedRingError::CommandFailed(e))
                }
            }
        }

        /// Turn off all LEDs
        pub fn off(&self) -> Result<(), LedRingError> {
            self.set_color(0, 0, 0)
        }

        pub fn set_color(&self, red: u8, green: u8, blue: u8) -> Result<(), LedRingError> {
            self.send_command(LedCommand::Mono { red, green, blue })
        }

        pub fn set_brightness(&self, brightness: u8) -> Result<(), LedRingError> {
            self.send_command(LedCommand::SetBrightness { brightness })
        }
    }

    impl Drop for LedRing {
        fn drop(&mut self) {
            let _ = self.off();
        }
    }
}

#[cfg(feature = "led_ring")]
pub use led_ring_impl::*;

#[cfg(not(feature = "led_ring"))]
pub mod stub {
    use thiserror::Error;

    #[derive(Error, Debug)]
    pub enum LedRingError {
        #[error("LED ring support not compiled in")]
        NotSupported,
    }

    pub struct LedRing;

    impl LedRing {
        pub fn new() -> Result<Self, LedRingError> {
            Err(LedRingError::NotSupported)
        }

        pub fn off(&self) -> Result<(), LedRingError> {
            Err(LedRingError::NotSupported)
        }

        pub fn set_color(&self, _red: u8, _green: u8, _blue: u8) -> Result<(), LedRingError> {
            Err(LedRingError::NotSupported)
        }

        pub fn set_brightness(&self, _brightness: u8) -> Result<(), LedRingError> {
            Err(LedRingError::NotSupported)
        }
    }
}

#[cfg(not(feature = "led_ring"))]
pub use stub::*;

/// Mix of the channel levels the ring should show.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RingMix {
    lit: [bool; Channel::COUNT],
    accent_duty: u8,
    capturing: bool,
}

impl RingMix {
    fn apply(&mut self, pin: Pin, high: bool) {
        match pin {
            Pin::Board(channel) => {
                self.lit[channel.index()] = high;
            }
            // Mirrors of the board pins; nothing extra to show.
            Pin::External(_) => {}
            Pin::CaptureIndicator => self.capturing = high,
        }
    }

    /// Colour for the current mix.
    pub fn color(&self) -> (u8, u8, u8) {
        let mut rgb = [0u16; 3];
        for (channel, component) in [Channel::Red, Channel::Green, Channel::Blue]
            .into_iter()
            .zip(rgb.iter_mut())
        {
            if self.lit[channel.index()] {
                *component = 255;
            }
        }

        // A PWM accent reports its level through the duty; a GPIO accent
        // through its board pin.
        let accent = if self.lit[Channel::Accent.index()] {
            100
        } else {
            self.accent_duty as u16
        };
        let (ar, ag, ab) = ACCENT_RGB;
        rgb[0] += ar as u16 * accent / 100;
        rgb[1] += ag as u16 * accent / 100;
        rgb[2] += ab as u16 * accent / 100;

        if rgb == [0, 0, 0] && self.capturing {
            return CAPTURE_RGB;
        }
        let clamp = |v: u16| v.min(255) as u8;
        (clamp(rgb[0]), clamp(rgb[1]), clamp(rgb[2]))
    }
}

/// Renders actuator output on the LED ring.
pub struct LedRingOutputs {
    ring: LedRing,
    mix: RingMix,
    shown: Option<(u8, u8, u8)>,
}

impl LedRingOutputs {
    pub fn open() -> Result<Self> {
        let ring = LedRing::new()?;
        ring.set_brightness(RING_BRIGHTNESS)?;
        ring.off()?;
        log::info!("💡 Rendering actuators on the LED ring");
        Ok(Self {
            ring,
            mix: RingMix::default(),
            shown: Some((0, 0, 0)),
        })
    }

    fn render(&mut self) -> Result<()> {
        let color = self.mix.color();
        if self.shown == Some(color) {
            return Ok(());
        }
        // Forget what is shown until the write succeeds, so a failed write
        // is retried on the next change.
        self.shown = None;
        let (red, green, blue) = color;
        self.ring.set_color(red, green, blue)?;
        self.shown = Some(color);
        Ok(())
    }
}

impl OutputBackend for LedRingOutputs {
    fn write(&mut self, pin: Pin, high: bool) -> Result<()> {
        self.mix.apply(pin, high);
        self.render()
    }

    fn set_duty(&mut self, channel: Channel, percent: u8) -> Result<()> {
        if channel != Channel::Accent {
            return Err(EdgeError::Output(format!("{} has no PWM output", channel)));
        }
        self.mix.accent_duty = percent.min(100);
        self.render()
    }
}
