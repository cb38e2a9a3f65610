//! Synchronous request/response bus over a `Port`, with retry, settling, and
//! inter-motor pacing timing discipline.
//!
//! The Bus owns its `Port` behind a single dedicated worker thread. Callers
//! send a request over a bounded command channel and block on a oneshot
//! reply, the same shape as the teacher's `XBoxController` background-thread
//! worker, adapted from fire-and-forget polling to blocking request/response
//! so exactly one request is ever in flight on the wire.

use std::thread;
use std::time::{Duration, Instant};

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use crossbeam_channel::{bounded, Sender};

use crate::codec::{self, Register};
use crate::error::{BusError, CodecError};
use crate::port::Port;

/// Minimum wait after transmitting before the first read attempt.
pub const WRITE_TO_READ_DELAY: Duration = Duration::from_millis(10);
/// Wait between retry attempts on the same request.
pub const RETRY_DELAY: Duration = Duration::from_millis(20);
/// Per-attempt read budget.
pub const READ_BUDGET: Duration = Duration::from_millis(150);
/// Pacing wait between requests addressed to different motors in a bulk op.
pub const INTER_MOTOR_DELAY: Duration = Duration::from_millis(10);
/// Total attempts (including the first) per request.
pub const MAX_ATTEMPTS: u32 = 3;

/// Fallback position reported for a motor that exhausts its retries during
/// a bulk `read_positions` call.
pub const FALLBACK_POSITION: u16 = 2047;

enum Request {
    ReadU16 { id: u8, addr: u8 },
    ReadU8 { id: u8, addr: u8 },
    WriteU16 { id: u8, addr: u8, value: u16 },
    WriteU8 { id: u8, addr: u8, value: u8 },
    Ping { id: u8 },
}

enum Reply {
    U16(Result<u16, BusError>),
    U8(Result<u8, BusError>),
    Ack(Result<(), BusError>),
    Bool(Result<bool, BusError>),
}

/// Synchronous, retrying, paced bus over a single `Port`. Exclusive: only
/// one request is ever in flight.
pub struct Bus {
    tx: Sender<(Request, Sender<Reply>)>,
    _worker: thread::JoinHandle<()>,
}

impl Bus {
    /// Wrap `port` and start the serializer worker thread.
    pub fn new(port: Box<dyn Port>) -> Bus {
        let (tx, rx) = bounded::<(Request, Sender<Reply>)>(1);
        let worker = thread::spawn(move || bus_worker(port, rx));
        Bus { tx, _worker: worker }
    }

    fn roundtrip(&self, request: Request) -> Reply {
        let (reply_tx, reply_rx) = bounded::<Reply>(1);
        // Exclusivity is enforced by the bounded(1) channel and the single
        // worker thread draining it one request at a time.
        if self.tx.send((request, reply_tx)).is_err() {
            return Reply::Ack(Err(BusError::Io {
                id: None,
                source: std::io::Error::new(std::io::ErrorKind::BrokenPipe, "bus worker gone"),
            }));
        }
        reply_rx.recv().unwrap_or(Reply::Ack(Err(BusError::Io {
            id: None,
            source: std::io::Error::new(std::io::ErrorKind::BrokenPipe, "bus worker gone"),
        })))
    }

    /// Read a 2-byte little-endian register. Exhausting 3 attempts is a
    /// hard `BusError::NoResponse`.
    pub fn read_u16(&self, id: u8, addr: u8) -> Result<u16, BusError> {
        match self.roundtrip(Request::ReadU16 { id, addr }) {
            Reply::U16(r) => r,
            _ => unreachable!("bus worker returned wrong reply variant"),
        }
    }

    /// Read a single-byte register.
    pub fn read_u8(&self, id: u8, addr: u8) -> Result<u8, BusError> {
        match self.roundtrip(Request::ReadU8 { id, addr }) {
            Reply::U8(r) => r,
            _ => unreachable!("bus worker returned wrong reply variant"),
        }
    }

    /// Write a 2-byte little-endian register. A write that times out with
    /// no reply at all is treated as success (STS3215 servos at 1M baud
    /// sometimes omit write acks); a malformed/wrong-id/non-zero-ERR
    /// reply still surfaces as an error.
    pub fn write_u16(&self, id: u8, addr: u8, value: u16) -> Result<(), BusError> {
        match self.roundtrip(Request::WriteU16 { id, addr, value }) {
            Reply::Ack(r) => r,
            _ => unreachable!("bus worker returned wrong reply variant"),
        }
    }

    /// Write a single-byte register (e.g. `Torque_Enable`).
    pub fn write_u8(&self, id: u8, addr: u8, value: u8) -> Result<(), BusError> {
        match self.roundtrip(Request::WriteU8 { id, addr, value }) {
            Reply::Ack(r) => r,
            _ => unreachable!("bus worker returned wrong reply variant"),
        }
    }

    /// Probe whether `id` is present and responding on the bus. `Ok(false)`
    /// means the motor stayed silent through all 3 attempts (not connected,
    /// or powered off); other `BusError`s (malformed/wrong-id/non-zero-ERR
    /// replies) still propagate, since those indicate a motor answered but
    /// the exchange was invalid, not that nothing is there.
    pub fn ping(&self, id: u8) -> Result<bool, BusError> {
        match self.roundtrip(Request::Ping { id }) {
            Reply::Bool(r) => r,
            _ => unreachable!("bus worker returned wrong reply variant"),
        }
    }

    /// Read `Present_Position` for each of `ids` in order, with
    /// `INTER_MOTOR_DELAY` pacing between motors. A motor that exhausts its
    /// retries resolves to `FALLBACK_POSITION` and the bulk call still
    /// succeeds.
    pub fn read_positions(&self, ids: &[u8]) -> Vec<u16> {
        let mut out = Vec::with_capacity(ids.len());
        for (i, &id) in ids.iter().enumerate() {
            if i > 0 {
                thread::sleep(INTER_MOTOR_DELAY);
            }
            let pos = match self.read_u16(id, Register::PresentPosition.addr()) {
                Ok(p) => p,
                Err(e) => {
                    tracing::warn!(
                        "motor {id} present-position read failed, using fallback {FALLBACK_POSITION}: {e}"
                    );
                    FALLBACK_POSITION
                }
            };
            out.push(pos);
        }
        out
    }

    /// Write `Torque_Enable = 0` for each of `ids`, with inter-motor pacing.
    /// Returns the first error encountered, if any, but attempts every id.
    pub fn release_torque(&self, ids: &[u8]) -> Result<(), BusError> {
        self.set_torque(ids, 0)
    }

    /// Write `Torque_Enable = 1` for each of `ids`, with inter-motor pacing.
    pub fn enable_torque(&self, ids: &[u8]) -> Result<(), BusError> {
        self.set_torque(ids, 1)
    }

    fn set_torque(&self, ids: &[u8], value: u8) -> Result<(), BusError> {
        let mut first_err = None;
        for (i, &id) in ids.iter().enumerate() {
            if i > 0 {
                thread::sleep(INTER_MOTOR_DELAY);
            }
            if let Err(e) = self.write_u8(id, Register::TorqueEnable.addr(), value) {
                tracing::warn!("motor {id} torque_enable={value} write failed: {e}");
                first_err.get_or_insert(e);
            }
        }
        match first_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

fn bus_worker(mut port: Box<dyn Port>, rx: crossbeam_channel::Receiver<(Request, Sender<Reply>)>) {
    for (request, reply_tx) in rx.iter() {
        let reply = match request {
            Request::ReadU16 { id, addr } => Reply::U16(
                exchange_read(&mut *port, id, addr, 2)
                    .map(|data| (&data[..]).read_u16::<LittleEndian>().unwrap()),
            ),
            Request::ReadU8 { id, addr } => {
                Reply::U8(exchange_read(&mut *port, id, addr, 1).map(|data| data[0]))
            }
            Request::WriteU16 { id, addr, value } => {
                let mut data = Vec::with_capacity(2);
                data.write_u16::<LittleEndian>(value).unwrap();
                Reply::Ack(exchange_write(&mut *port, id, addr, &data))
            }
            Request::WriteU8 { id, addr, value } => {
                Reply::Ack(exchange_write(&mut *port, id, addr, &[value]))
            }
            Request::Ping { id } => Reply::Bool(exchange_ping(&mut *port, id)),
        };
        let _ = reply_tx.send(reply);
    }
    port.close();
}

/// Run the flush/transmit/settle/read/retry sequence for a READ request,
/// returning the reply's data bytes. `count` is both the requested register
/// width and the exact data length a valid reply must carry.
fn exchange_read(port: &mut dyn Port, id: u8, addr: u8, count: u8) -> Result<Vec<u8>, BusError> {
    let packet = codec::build_read(id, addr, count);
    exchange(port, id, addr, &packet, Some(count as usize))
}

/// Run the flush/transmit/settle/read/retry sequence for a WRITE request. A
/// clean timeout (zero bytes read on every attempt) is treated as success
/// any parsed-but-invalid reply still propagates as an error. Write acks
/// carry no data, so the reply's data length is not checked.
fn exchange_write(port: &mut dyn Port, id: u8, addr: u8, data: &[u8]) -> Result<(), BusError> {
    let packet = codec::build_write(id, addr, data);
    match exchange(port, id, addr, &packet, None) {
        Ok(_) => Ok(()),
        Err(BusError::NoResponse { .. }) => {
            tracing::debug!("motor {id} gave no write ack at register 0x{addr:02X}, treating as success");
            Ok(())
        }
        Err(e) => Err(e),
    }
}

/// Run the flush/transmit/settle/read/retry sequence for a PING request. A
/// clean exhaustion (silence on every attempt) means the motor isn't there,
/// not a bus fault, so it resolves to `Ok(false)` rather than an error; any
/// other failure (malformed/wrong-id/non-zero-ERR) still propagates.
fn exchange_ping(port: &mut dyn Port, id: u8) -> Result<bool, BusError> {
    let packet = codec::build_ping(id);
    match exchange(port, id, 0, &packet, None) {
        Ok(_) => Ok(true),
        Err(BusError::NoResponse { .. }) => Ok(false),
        Err(e) => Err(e),
    }
}

fn exchange(
    port: &mut dyn Port,
    id: u8,
    addr: u8,
    packet: &[u8],
    expected_len: Option<usize>,
) -> Result<Vec<u8>, BusError> {
    // Flushed once, before the first attempt: stale bytes on the wire are a
    // leftover from whatever came before this request, not from our own
    // retries. Re-flushing between retries would risk discarding a reply
    // to the attempt we just made.
    port.flush_rx();

    let mut last_err = None;
    for attempt in 1..=MAX_ATTEMPTS {
        port.write(packet)?;
        thread::sleep(WRITE_TO_READ_DELAY);

        match read_and_validate(port, id, addr, expected_len) {
            Ok(data) => return Ok(data),
            Err(e) => {
                tracing::debug!("bus attempt {attempt}/{MAX_ATTEMPTS} for motor {id} failed: {e}");
                last_err = Some(e);
                if attempt < MAX_ATTEMPTS {
                    thread::sleep(RETRY_DELAY);
                }
            }
        }
    }
    Err(last_err.unwrap_or(BusError::NoResponse { id, addr }))
}

/// Read one reply, parse it, and validate it against `id`/`expected_len`.
/// A checksum-valid frame whose data length doesn't match what the request
/// asked for is treated the same as any other malformed frame — retried,
/// never trusted enough to index into or decode, per the spec's error
/// taxonomy (malformed frames are retried exactly like timeouts).
fn read_and_validate(
    port: &mut dyn Port,
    id: u8,
    addr: u8,
    expected_len: Option<usize>,
) -> Result<Vec<u8>, BusError> {
    let deadline_start = Instant::now();
    let mut buf = Vec::new();
    while deadline_start.elapsed() < READ_BUDGET {
        let remaining = READ_BUDGET.saturating_sub(deadline_start.elapsed());
        let chunk = port.read(remaining)?;
        if chunk.is_empty() {
            break;
        }
        buf.extend_from_slice(&chunk);
        if buf.len() >= 6 {
            break;
        }
    }

    if buf.len() < 6 {
        return Err(BusError::NoResponse { id, addr });
    }

    let status = codec::parse_status(&buf)?;
    if status.id != id {
        return Err(BusError::NoResponse { id, addr });
    }
    if status.err != 0 {
        return Err(BusError::ServoError {
            id,
            addr,
            err_byte: status.err,
        });
    }
    if let Some(want) = expected_len {
        if status.data.len() != want {
            return Err(BusError::Codec(CodecError::MalformedFrame {
                id: Some(id),
                reason: format!(
                    "register 0x{addr:02X} expected {want} data bytes, got {}",
                    status.data.len()
                ),
            }));
        }
    }
    Ok(status.data)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::FakePort;

    fn boxed(port: FakePort) -> Box<dyn Port> {
        Box::new(port)
    }

    fn status_reply(id: u8, data: &[u8]) -> Vec<u8> {
        let mut reply = vec![0xFF, 0xFF, id, (2 + data.len()) as u8, 0x00];
        reply.extend_from_slice(data);
        let chk = codec::checksum(&reply[2..]);
        reply.push(chk);
        reply
    }

    #[test]
    fn read_u16_returns_value_on_clean_reply() {
        let mut fake = FakePort::new();
        fake.queue_reply(status_reply(1, &0x0238u16.to_le_bytes()));
        let bus = Bus::new(boxed(fake));
        let value = bus.read_u16(1, Register::PresentPosition.addr()).unwrap();
        assert_eq!(value, 0x0238);
    }

    #[test]
    fn read_u16_retries_then_fails_after_three_attempts() {
        let mut fake = FakePort::new();
        fake.queue_timeout();
        fake.queue_timeout();
        fake.queue_timeout();
        let bus = Bus::new(boxed(fake));
        let err = bus.read_u16(1, Register::PresentPosition.addr()).unwrap_err();
        assert!(matches!(err, BusError::NoResponse { .. }));
    }

    #[test]
    fn read_u16_recovers_after_transient_timeout() {
        let mut fake = FakePort::new();
        fake.queue_timeout();
        fake.queue_reply(status_reply(2, &0x0800u16.to_le_bytes()));
        let bus = Bus::new(boxed(fake));
        let value = bus.read_u16(2, Register::GoalPosition.addr()).unwrap();
        assert_eq!(value, 0x0800);
    }

    #[test]
    fn write_u16_treats_clean_timeout_as_success() {
        let mut fake = FakePort::new();
        fake.queue_timeout();
        fake.queue_timeout();
        fake.queue_timeout();
        let bus = Bus::new(boxed(fake));
        bus.write_u16(3, Register::GoalPosition.addr(), 0x0800)
            .expect("write with no ack should succeed");
    }

    #[test]
    fn write_u16_surfaces_servo_error_byte() {
        let mut fake = FakePort::new();
        let mut reply = vec![0xFF, 0xFF, 3, 2, 0x01];
        let chk = codec::checksum(&reply[2..]);
        reply.push(chk);
        fake.queue_reply(reply);
        let bus = Bus::new(boxed(fake));
        let err = bus
            .write_u16(3, Register::GoalPosition.addr(), 0x0800)
            .unwrap_err();
        assert!(matches!(err, BusError::ServoError { err_byte: 1, .. }));
    }

    #[test]
    fn read_positions_falls_back_to_mid_travel_on_exhaustion() {
        let mut fake = FakePort::new();
        fake.queue_reply(status_reply(1, &2047u16.to_le_bytes()));
        fake.queue_timeout();
        fake.queue_timeout();
        fake.queue_timeout();
        let bus = Bus::new(boxed(fake));
        let positions = bus.read_positions(&[1, 2]);
        assert_eq!(positions, vec![2047, FALLBACK_POSITION]);
    }

    #[test]
    fn release_torque_writes_zero_to_every_motor() {
        let mut fake = FakePort::new();
        for _ in 0..3 {
            fake.queue_timeout();
        }
        let bus = Bus::new(boxed(fake));
        bus.release_torque(&[1, 2, 3]).unwrap();
    }

    #[test]
    fn ping_returns_true_when_motor_responds() {
        let mut fake = FakePort::new();
        fake.queue_reply(status_reply(7, &[]));
        let bus = Bus::new(boxed(fake));
        assert!(bus.ping(7).unwrap());
    }

    #[test]
    fn ping_returns_false_on_silence_rather_than_erroring() {
        let mut fake = FakePort::new();
        fake.queue_timeout();
        fake.queue_timeout();
        fake.queue_timeout();
        let bus = Bus::new(boxed(fake));
        assert!(!bus.ping(7).unwrap());
    }

    #[test]
    fn read_u16_retries_on_checksum_valid_but_short_data() {
        // A reply whose LEN/data claim only 1 data byte for a 2-byte
        // register read must not be trusted, even though its checksum is
        // internally consistent — it must be retried like any other
        // malformed frame, never indexed into directly.
        let mut fake = FakePort::new();
        fake.queue_reply(status_reply(1, &[0x38]));
        fake.queue_reply(status_reply(1, &0x0238u16.to_le_bytes()));
        let bus = Bus::new(boxed(fake));
        let value = bus.read_u16(1, Register::PresentPosition.addr()).unwrap();
        assert_eq!(value, 0x0238);
    }

    #[test]
    fn read_u16_fails_after_retries_on_persistently_short_data() {
        let mut fake = FakePort::new();
        for _ in 0..3 {
            fake.queue_reply(status_reply(1, &[0x38]));
        }
        let bus = Bus::new(boxed(fake));
        let err = bus.read_u16(1, Register::PresentPosition.addr()).unwrap_err();
        assert!(matches!(err, BusError::Codec(CodecError::MalformedFrame { .. })));
    }
}
