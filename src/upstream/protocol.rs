//! Wire protocol for the broker gateway.
//!
//! Frames are a 4-byte big-endian payload length followed by the payload;
//! payloads are NUL-terminated text fields. The session only speaks the
//! handful of messages the gateway needs for tick-by-tick streaming:
//! the version handshake, `StartApi`, tick-by-tick subscribe/cancel, and
//! the inbound tick and error messages.

use anyhow::{bail, Context, Result};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::types::{TickMessage, TickType};

/// Range of API versions offered during the handshake.
pub const MIN_CLIENT_VERSION: i32 = 100;
pub const MAX_CLIENT_VERSION: i32 = 187;

/// Upper bound on a single inbound frame; anything larger is corruption.
const MAX_FRAME_SIZE: u32 = 16 * 1024 * 1024;

/// Outgoing message ids.
pub const START_API: i32 = 71;
pub const REQUEST_TICK_BY_TICK: i32 = 97;
pub const CANCEL_TICK_BY_TICK: i32 = 98;

/// Incoming message ids the session interprets.
pub const ERROR_MESSAGE: i32 = 4;
pub const NEXT_VALID_ID: i32 = 9;
pub const MANAGED_ACCOUNTS: i32 = 15;
pub const TICK_BY_TICK: i32 = 99;

/// Outbound message under construction: ordered NUL-terminated fields.
#[derive(Debug, Default, Clone)]
pub struct RequestMessage {
    fields: Vec<String>,
}

impl RequestMessage {
    pub fn push_field<T: ToField>(&mut self, value: &T) -> &mut Self {
        self.fields.push(value.to_field());
        self
    }

    /// Payload text: every field NUL-terminated.
    pub fn encode(&self) -> String {
        let mut out = String::new();
        for field in &self.fields {
            out.push_str(field);
            out.push('\0');
        }
        out
    }
}

pub trait ToField {
    fn to_field(&self) -> String;
}

impl ToField for i32 {
    fn to_field(&self) -> String {
        self.to_string()
    }
}

impl ToField for u32 {
    fn to_field(&self) -> String {
        self.to_string()
    }
}

impl ToField for f64 {
    fn to_field(&self) -> String {
        self.to_string()
    }
}

impl ToField for bool {
    fn to_field(&self) -> String {
        if *self { "1" } else { "0" }.to_string()
    }
}

impl ToField for &str {
    fn to_field(&self) -> String {
        (*self).to_string()
    }
}

impl ToField for String {
    fn to_field(&self) -> String {
        self.clone()
    }
}

/// Inbound message: NUL-separated fields consumed with a cursor.
#[derive(Debug, Clone)]
pub struct ResponseMessage {
    fields: Vec<String>,
    cursor: usize,
}

impl ResponseMessage {
    pub fn from_payload(payload: &str) -> Self {
        let mut fields: Vec<String> = payload.split('\0').map(str::to_string).collect();
        // A well-formed payload ends with a terminator, leaving one empty
        // trailing split.
        if fields.last().map(|f| f.is_empty()).unwrap_or(false) {
            fields.pop();
        }
        Self { fields, cursor: 0 }
    }

    pub fn message_type(&self) -> i32 {
        self.fields
            .first()
            .and_then(|f| f.parse().ok())
            .unwrap_or(-1)
    }

    pub fn skip(&mut self) {
        self.cursor += 1;
    }

    pub fn next_string(&mut self) -> Result<String> {
        let field = self
            .fields
            .get(self.cursor)
            .with_context(|| format!("message ended at field {}", self.cursor))?;
        self.cursor += 1;
        Ok(field.clone())
    }

    pub fn next_int(&mut self) -> Result<i32> {
        let field = self.next_string()?;
        if field.is_empty() {
            return Ok(0);
        }
        field
            .parse()
            .with_context(|| format!("not an integer: {field:?}"))
    }

    pub fn next_long(&mut self) -> Result<i64> {
        let field = self.next_string()?;
        if field.is_empty() {
            return Ok(0);
        }
        field
            .parse()
            .with_context(|| format!("not a long: {field:?}"))
    }

    pub fn next_double(&mut self) -> Result<f64> {
        let field = self.next_string()?;
        if field.is_empty() {
            return Ok(0.0);
        }
        field
            .parse()
            .with_context(|| format!("not a double: {field:?}"))
    }
}

/// `length || payload` frame bytes.
pub fn frame_bytes(payload: &str) -> Vec<u8> {
    let mut out = Vec::with_capacity(4 + payload.len());
    out.extend_from_slice(&(payload.len() as u32).to_be_bytes());
    out.extend_from_slice(payload.as_bytes());
    out
}

/// Initial handshake bytes: the `API\0` preamble plus the framed version
/// range.
pub fn handshake_bytes() -> Vec<u8> {
    let version = format!("v{MIN_CLIENT_VERSION}..{MAX_CLIENT_VERSION}");
    let mut out = Vec::from(&b"API\0"[..]);
    out.extend_from_slice(&frame_bytes(&version));
    out
}

/// Write one framed message.
pub async fn write_frame<W: AsyncWrite + Unpin>(w: &mut W, payload: &str) -> Result<()> {
    w.write_all(&frame_bytes(payload)).await?;
    w.flush().await?;
    Ok(())
}

/// Read one framed payload.
pub async fn read_frame<R: AsyncRead + Unpin>(r: &mut R) -> Result<String> {
    let mut len_buf = [0u8; 4];
    r.read_exact(&mut len_buf).await.context("reading frame length")?;
    let len = u32::from_be_bytes(len_buf);
    if len == 0 || len > MAX_FRAME_SIZE {
        bail!("invalid frame length: {len}");
    }
    let mut payload = vec![0u8; len as usize];
    r.read_exact(&mut payload).await.context("reading frame payload")?;
    Ok(String::from_utf8_lossy(&payload).into_owned())
}

/// Server half of the handshake.
#[derive(Debug, Clone)]
pub struct HandshakeData {
    pub server_version: i32,
    pub server_time: String,
}

pub fn parse_handshake(message: &mut ResponseMessage) -> Result<HandshakeData> {
    let server_version = message.next_int()?;
    let server_time = message.next_string().unwrap_or_default();
    if server_version < MIN_CLIENT_VERSION {
        bail!("server version {server_version} below supported minimum {MIN_CLIENT_VERSION}");
    }
    Ok(HandshakeData {
        server_version,
        server_time,
    })
}

/// `StartApi` announcing our client id.
pub fn encode_start_api(client_id: i32) -> RequestMessage {
    const VERSION: i32 = 2;
    let mut message = RequestMessage::default();
    message.push_field(&START_API);
    message.push_field(&VERSION);
    message.push_field(&client_id);
    message.push_field(&""); // optional capabilities
    message
}

/// Tick-by-tick subscription for a contract known only by its id. The
/// gateway resolves the rest of the contract from `cid` + SMART routing.
pub fn encode_tick_by_tick(rid: u32, cid: u32, tt: TickType) -> RequestMessage {
    let mut message = RequestMessage::default();
    message.push_field(&REQUEST_TICK_BY_TICK);
    message.push_field(&rid);
    message.push_field(&cid);
    message.push_field(&""); // symbol
    message.push_field(&""); // security type
    message.push_field(&""); // last trade date
    message.push_field(&0.0); // strike
    message.push_field(&""); // right
    message.push_field(&""); // multiplier
    message.push_field(&"SMART"); // exchange
    message.push_field(&""); // primary exchange
    message.push_field(&""); // currency
    message.push_field(&""); // local symbol
    message.push_field(&""); // trading class
    message.push_field(&tt.wire_label());
    message.push_field(&0); // number of ticks (0 = streaming)
    message.push_field(&false); // ignore size
    message
}

pub fn encode_cancel_tick_by_tick(rid: u32) -> RequestMessage {
    let mut message = RequestMessage::default();
    message.push_field(&CANCEL_TICK_BY_TICK);
    message.push_field(&rid);
    message
}

/// A decoded tick-by-tick callback, before stamping and publication.
#[derive(Debug, Clone, PartialEq)]
pub enum RawTick {
    Trade {
        tt: TickType,
        time_secs: u64,
        price: f64,
        size: f64,
        unreported: bool,
    },
    BidAsk {
        time_secs: u64,
        bid_price: f64,
        ask_price: f64,
        bid_size: f64,
        ask_size: f64,
        bid_past_low: bool,
        ask_past_high: bool,
    },
    MidPoint {
        time_secs: u64,
        mid: f64,
    },
}

impl RawTick {
    pub fn tick_type(&self) -> TickType {
        match self {
            RawTick::Trade { tt, .. } => *tt,
            RawTick::BidAsk { .. } => TickType::BidAsk,
            RawTick::MidPoint { .. } => TickType::MidPoint,
        }
    }
}

/// Messages the session reacts to.
#[derive(Debug, Clone)]
pub enum UpstreamEvent {
    Tick { rid: u32, raw: RawTick },
    Error { rid: i32, code: i32, message: String },
    Other { message_type: i32 },
}

/// Decode one inbound payload into an event.
pub fn decode_event(message: &mut ResponseMessage) -> Result<UpstreamEvent> {
    match message.message_type() {
        TICK_BY_TICK => decode_tick_by_tick(message),
        ERROR_MESSAGE => decode_error(message),
        other => Ok(UpstreamEvent::Other {
            message_type: other,
        }),
    }
}

fn decode_tick_by_tick(message: &mut ResponseMessage) -> Result<UpstreamEvent> {
    message.skip(); // message type
    let rid = message.next_int()? as u32;
    let inner_type = message.next_int()?;
    let time_secs = message.next_long()?.max(0) as u64;

    let raw = match inner_type {
        1 | 2 => {
            let price = message.next_double()?;
            let size = message.next_double()?;
            let mask = message.next_int()?;
            // past-limit (0x1) is not carried in the stored record
            let unreported = mask & 0x2 != 0;
            RawTick::Trade {
                tt: if inner_type == 1 {
                    TickType::Last
                } else {
                    TickType::AllLast
                },
                time_secs,
                price,
                size,
                unreported,
            }
        }
        3 => {
            let bid_price = message.next_double()?;
            let ask_price = message.next_double()?;
            let bid_size = message.next_double()?;
            let ask_size = message.next_double()?;
            let mask = message.next_int()?;
            RawTick::BidAsk {
                time_secs,
                bid_price,
                ask_price,
                bid_size,
                ask_size,
                bid_past_low: mask & 0x1 != 0,
                ask_past_high: mask & 0x2 != 0,
            }
        }
        4 => RawTick::MidPoint {
            time_secs,
            mid: message.next_double()?,
        },
        other => bail!("unexpected tick-by-tick inner type: {other}"),
    };

    Ok(UpstreamEvent::Tick { rid, raw })
}

fn decode_error(message: &mut ResponseMessage) -> Result<UpstreamEvent> {
    message.skip(); // message type
    message.skip(); // version
    let rid = message.next_int()?;
    let code = message.next_int()?;
    let text = message.next_string().unwrap_or_default();
    Ok(UpstreamEvent::Error {
        rid,
        code,
        message: text,
    })
}

/// Gateway error codes that terminate the subscription for that request.
pub fn is_contract_rejection(code: i32) -> bool {
    // 200: no security definition found; 203: not allowed for this account;
    // 354: not subscribed to requested market data.
    matches!(code, 200 | 203 | 354)
}

/// Stamp and convert a raw tick into the canonical compact record.
pub fn encode_tick(raw: &RawTick, cid: u32, rid: u32, st_micros: u64) -> TickMessage {
    match raw {
        RawTick::Trade {
            tt,
            time_secs,
            price,
            size,
            unreported,
        } => {
            let mut msg = TickMessage::new(time_secs * 1_000_000, st_micros, cid, *tt, rid);
            msg.p = Some(*price);
            msg.s = Some(*size);
            if *unreported {
                msg.upt = Some(true);
            }
            msg
        }
        RawTick::BidAsk {
            time_secs,
            bid_price,
            ask_price,
            bid_size,
            ask_size,
            bid_past_low,
            ask_past_high,
        } => {
            let mut msg = TickMessage::new(
                time_secs * 1_000_000,
                st_micros,
                cid,
                TickType::BidAsk,
                rid,
            );
            msg.bp = Some(*bid_price);
            msg.ap = Some(*ask_price);
            msg.bs = Some(*bid_size);
            msg.as_ = Some(*ask_size);
            if *bid_past_low {
                msg.bpl = Some(true);
            }
            if *ask_past_high {
                msg.aph = Some(true);
            }
            msg
        }
        RawTick::MidPoint { time_secs, mid } => {
            let mut msg = TickMessage::new(
                time_secs * 1_000_000,
                st_micros,
                cid,
                TickType::MidPoint,
                rid,
            );
            msg.mp = Some(*mid);
            msg
        }
    }
}
