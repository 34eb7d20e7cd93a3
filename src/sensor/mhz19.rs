// MH-Z19B CO2 sensor over a 9600 baud serial line.
// Every exchange is a 9-byte frame: 0xFF, command, 6 data bytes, checksum.

use super::SensorError;
use bytes::BytesMut;
use futures::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_serial::{SerialPortBuilderExt, SerialStream};
use tokio_util::codec::{Decoder, Encoder, Framed};
use tracing::{debug, warn};

pub const BAUD: u32 = 9600;
const FRAME_LEN: usize = 9;
const START: u8 = 0xff;
const CMD_READ_CO2: u8 = 0x86;

pub type Frame = [u8; FRAME_LEN];

pub const READ_CO2: Frame = [0xff, 0x01, 0x86, 0x00, 0x00, 0x00, 0x00, 0x00, 0x79];
pub const ABC_OFF: Frame = [0xff, 0x01, 0x79, 0x00, 0x00, 0x00, 0x00, 0x00, 0x86];

// Checksum errors retried before the read gives up
const MAX_RETRIES: usize = 6;

pub fn checksum(frame: &[u8]) -> u8 {
    let sum = frame[1..8].iter().fold(0u8, |acc, b| acc.wrapping_add(*b));
    0xffu8.wrapping_sub(sum).wrapping_add(1)
}

/// Frames the byte stream into 9-byte packets, resynchronising on the start byte.
/// Checksums are left to the caller so one bad packet does not end the stream.
pub struct FrameCodec;

impl Decoder for FrameCodec {
    type Item = Frame;
    type Error = SensorError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        match src.iter().position(|b| *b == START) {
            Some(0) => (),
            Some(n) => {
                debug!("Discarding {n} bytes of line noise");
                let _ = src.split_to(n);
            }
            None => {
                src.clear();
                return Ok(None);
            }
        }
        if src.len() < FRAME_LEN {
            return Ok(None);
        }
        let mut frame = [0u8; FRAME_LEN];
        frame.copy_from_slice(&src.split_to(FRAME_LEN));
        Ok(Some(frame))
    }
}

impl Encoder<Frame> for FrameCodec {
    type Error = SensorError;

    fn encode(&mut self, item: Frame, dst: &mut BytesMut) -> Result<(), Self::Error> {
        dst.extend_from_slice(&item);
        Ok(())
    }
}

/// Validates a response frame. `Ok(None)` for frames answering other commands.
pub fn parse_response(frame: &Frame) -> Result<Option<u16>, SensorError> {
    let expected = checksum(frame);
    if expected != frame[8] {
        return Err(SensorError::Checksum {
            expected,
            got: frame[8],
        });
    }
    if frame[1] != CMD_READ_CO2 {
        return Ok(None);
    }
    Ok(Some(u16::from(frame[2]) * 256 + u16::from(frame[3])))
}

pub struct Mhz19<T = SerialStream> {
    port: Framed<T, FrameCodec>,
}

impl Mhz19<SerialStream> {
    pub async fn open(tty: &str) -> Result<Self, SensorError> {
        #[allow(unused_mut)]
        let mut port = tokio_serial::new(tty, BAUD).open_native_async()?;
        #[cfg(unix)]
        port.set_exclusive(false)?;
        let mut sensor = Self::new(port);
        // automatic baseline calibration drifts indoors, where air never reaches 400 ppm
        sensor.port.send(ABC_OFF).await?;
        Ok(sensor)
    }
}

impl<T> Mhz19<T>
where
    T: AsyncRead + AsyncWrite + Unpin,
{
    pub fn new(io: T) -> Self {
        Self {
            port: FrameCodec.framed(io),
        }
    }

    /// Asks for a reading, retrying on corrupted responses.
    pub async fn read_co2(&mut self) -> Result<u16, SensorError> {
        let mut errors = 0;
        loop {
            match self.request().await {
                Ok(ppm) => return Ok(ppm),
                Err(e @ SensorError::Checksum { .. }) => {
                    if errors >= MAX_RETRIES {
                        return Err(e);
                    }
                    errors += 1;
                    warn!("MH-Z19B: {e}, retry {errors}/{MAX_RETRIES}");
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn request(&mut self) -> Result<u16, SensorError> {
        let stale = self.port.read_buffer().len();
        if stale > 0 {
            debug!("MH-Z19B: dropping {stale} stale bytes before the request");
            self.port.read_buffer_mut().clear();
        }
        self.port.send(READ_CO2).await?;
        loop {
            let frame = self.port.next().await.ok_or(SensorError::Closed)??;
            match parse_response(&frame)? {
                Some(ppm) => return Ok(ppm),
                None => debug!("MH-Z19B: ignoring response to command {:#04x}", frame[1]),
            }
        }
    }
}
