//! JSON-lines message formats at the process boundary

use crate::candle::{Candlestick, Tick};
use crate::error::{ChartError, ChartResult};
use crate::session::SubscribeResponse;
use crate::timeframe::Timeframe;
use serde::{Deserialize, Serialize};
use services_common::{Px, Qty, Symbol, TimestampMs};

/// Decimal as sent by feeds: a JSON number or an exact string
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(untagged)]
pub enum DecimalValue {
    /// Exact decimal string, preferred
    Text(String),
    /// Floating point number, rounded to fixed point
    Number(f64),
}

impl Default for DecimalValue {
    fn default() -> Self {
        Self::Number(0.0)
    }
}

impl DecimalValue {
    fn to_px(&self) -> ChartResult<Px> {
        match self {
            Self::Text(s) => Ok(s.parse()?),
            Self::Number(n) if n.is_finite() => Ok(Px::new(*n)),
            Self::Number(n) => Err(ChartError::InvalidRequest(format!("non-finite price {n}"))),
        }
    }

    fn to_qty(&self) -> ChartResult<Qty> {
        match self {
            Self::Text(s) => Ok(s.parse()?),
            Self::Number(n) if n.is_finite() => Ok(Qty::new(*n)),
            Self::Number(n) => Err(ChartError::InvalidRequest(format!("non-finite volume {n}"))),
        }
    }
}

/// One inbound trade
///
/// `{"symbol":"BTCUSD","timestamp_msec":61000,"price":"105.5","volume":0.25}`
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct TickMessage {
    /// Instrument
    pub symbol: String,
    /// Exchange time, epoch milliseconds
    pub timestamp_msec: i64,
    /// Trade price
    pub price: DecimalValue,
    /// Trade size
    #[serde(default)]
    pub volume: DecimalValue,
    /// Exchange trade id
    #[serde(default)]
    pub trade_id: Option<u64>,
}

impl TryFrom<TickMessage> for Tick {
    type Error = ChartError;

    fn try_from(msg: TickMessage) -> ChartResult<Self> {
        Ok(Self {
            symbol: Symbol::new(&msg.symbol)?,
            timestamp: TimestampMs::from_millis(msg.timestamp_msec),
            price: msg.price.to_px()?,
            volume: msg.volume.to_qty()?,
            trade_id: msg.trade_id,
        })
    }
}

/// Parse one JSON line into a validated tick
pub fn parse_tick_line(line: &str) -> ChartResult<Tick> {
    let msg: TickMessage = serde_json::from_str(line)
        .map_err(|e| ChartError::InvalidRequest(format!("malformed tick: {e}")))?;
    let tick = Tick::try_from(msg)?;
    tick.validate()?;
    Ok(tick)
}

/// One outbound bar, prices as exact decimal strings
#[allow(missing_docs)] // mirrors the persisted columns
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BarMessage {
    pub symbol: String,
    pub timeframe: Timeframe,
    pub timestamp_msec: i64,
    pub open: String,
    pub high: String,
    pub low: String,
    pub close: String,
    pub volume: String,
    pub tick_count: u64,
}

impl From<&Candlestick> for BarMessage {
    fn from(bar: &Candlestick) -> Self {
        Self {
            symbol: bar.key.symbol.to_string(),
            timeframe: bar.key.timeframe,
            timestamp_msec: bar.key.start.as_millis(),
            open: bar.open.to_string(),
            high: bar.high.to_string(),
            low: bar.low.to_string(),
            close: bar.close.to_string(),
            volume: bar.volume.to_string(),
            tick_count: bar.tick_count,
        }
    }
}

impl From<&SubscribeResponse> for BarMessage {
    fn from(item: &SubscribeResponse) -> Self {
        Self::from(&item.bar)
    }
}
