//! # Network Transports
//!
//! Real implementations of the link, time, and weather transports. Each
//! one hands the blocking part of an operation to a Tokio runtime and
//! exposes the begin/poll shape the tasks expect: `begin_*` spawns the
//! work, `poll_*` checks a oneshot channel without ever blocking the
//! scheduler tick.

use crate::transport::{
    LinkPoll, SourcePoll, TimeSource, WeatherQuery, WeatherSource, WifiLink,
};
use chrono::{DateTime, Utc};
use log::debug;
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::runtime::Handle;
use tokio::sync::oneshot;
use tokio::sync::oneshot::error::TryRecvError;

const WEATHER_URL: &str = "https://api.openweathermap.org/data/2.5/weather";
const NTP_PORT: u16 = 123;
// Seconds between the NTP epoch (1900) and the Unix epoch (1970).
const NTP_UNIX_OFFSET: i64 = 2_208_988_800;

fn poll_receiver<T>(slot: &mut Option<oneshot::Receiver<Result<T, String>>>) -> SourcePoll<T> {
    let Some(rx) = slot.as_mut() else {
        return SourcePoll::Idle;
    };
    match rx.try_recv() {
        Ok(Ok(value)) => {
            *slot = None;
            SourcePoll::Ready(value)
        }
        Ok(Err(err)) => {
            *slot = None;
            SourcePoll::Failed(err)
        }
        Err(TryRecvError::Empty) => SourcePoll::Pending,
        Err(TryRecvError::Closed) => {
            *slot = None;
            SourcePoll::Failed("worker dropped".to_string())
        }
    }
}

/// OpenWeather current-conditions fetch over HTTPS.
pub struct HttpWeatherSource {
    client: reqwest::Client,
    handle: Handle,
    in_flight: Option<oneshot::Receiver<Result<Vec<u8>, String>>>,
}

impl HttpWeatherSource {
    pub fn new(handle: Handle, timeout: Duration) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(HttpWeatherSource {
            client,
            handle,
            in_flight: None,
        })
    }
}

impl WeatherSource for HttpWeatherSource {
    fn begin_fetch(&mut self, query: &WeatherQuery) {
        let (tx, rx) = oneshot::channel();
        let client = self.client.clone();
        let params = [
            ("q", query.city.clone()),
            ("units", query.units.clone()),
            ("appid", query.api_key.clone()),
        ];
        debug!("weather fetch for {}", query.city);
        self.handle.spawn(async move {
            let result = async {
                let response = client
                    .get(WEATHER_URL)
                    .query(&params)
                    .send()
                    .await
                    .map_err(|e| e.to_string())?
                    .error_for_status()
                    .map_err(|e| e.to_string())?;
                let body = response.bytes().await.map_err(|e| e.to_string())?;
                Ok(body.to_vec())
            }
            .await;
            let _ = tx.send(result);
        });
        self.in_flight = Some(rx);
    }

    fn poll_fetch(&mut self) -> SourcePoll<Vec<u8>> {
        poll_receiver(&mut self.in_flight)
    }
}

fn be32(bytes: &[u8], at: usize) -> u32 {
    ((bytes[at] as u32) << 24)
        | ((bytes[at + 1] as u32) << 16)
        | ((bytes[at + 2] as u32) << 8)
        | (bytes[at + 3] as u32)
}

async fn sntp_query(server: String) -> Result<DateTime<Utc>, String> {
    let socket = UdpSocket::bind("0.0.0.0:0").await.map_err(|e| e.to_string())?;
    socket
        .connect((server.as_str(), NTP_PORT))
        .await
        .map_err(|e| e.to_string())?;

    // Client request: LI 0, version 3, mode 3, everything else zero.
    let mut request = [0u8; 48];
    request[0] = 0x1B;
    socket.send(&request).await.map_err(|e| e.to_string())?;

    let mut reply = [0u8; 48];
    let n = tokio::time::timeout(Duration::from_secs(5), socket.recv(&mut reply))
        .await
        .map_err(|_| "ntp reply timed out".to_string())?
        .map_err(|e| e.to_string())?;
    if n < 48 {
        return Err(format!("short ntp reply ({n} bytes)"));
    }
    if reply[0] & 0x07 != 4 {
        return Err("ntp reply is not in server mode".to_string());
    }
    if reply[1] == 0 {
        // Stratum 0 is a kiss-of-death packet.
        return Err("ntp server refused (stratum 0)".to_string());
    }

    // Transmit timestamp: 32.32 fixed point from the 1900 epoch.
    let secs = be32(&reply, 40) as i64 - NTP_UNIX_OFFSET;
    let frac = be32(&reply, 44) as u64;
    let nanos = ((frac * 1_000_000_000) >> 32) as u32;
    DateTime::<Utc>::from_timestamp(secs, nanos)
        .ok_or_else(|| "ntp timestamp out of range".to_string())
}

/// Minimal SNTP (RFC 4330) client. One request, one reply, the server's
/// transmit timestamp taken as the answer. Round-trip compensation is
/// pointless at one-second display resolution.
pub struct SntpTimeSource {
    server: String,
    handle: Handle,
    in_flight: Option<oneshot::Receiver<Result<DateTime<Utc>, String>>>,
}

impl SntpTimeSource {
    pub fn new(handle: Handle, server: String) -> Self {
        SntpTimeSource {
            server,
            handle,
            in_flight: None,
        }
    }
}

impl TimeSource for SntpTimeSource {
    fn begin_query(&mut self) {
        let (tx, rx) = oneshot::channel();
        let server = self.server.clone();
        debug!("ntp query to {server}");
        self.handle.spawn(async move {
            let _ = tx.send(sntp_query(server).await);
        });
        self.in_flight = Some(rx);
    }

    fn poll_query(&mut self) -> SourcePoll<DateTime<Utc>> {
        poll_receiver(&mut self.in_flight)
    }
}

/// Answers time queries from the host clock. Used in development runs
/// where the host is already NTP-disciplined.
#[derive(Default)]
pub struct HostTimeSource {
    armed: bool,
}

impl HostTimeSource {
    pub fn new() -> Self {
        Self::default()
    }
}

impl TimeSource for HostTimeSource {
    fn begin_query(&mut self) {
        self.armed = true;
    }

    fn poll_query(&mut self) -> SourcePoll<DateTime<Utc>> {
        if self.armed {
            self.armed = false;
            SourcePoll::Ready(Utc::now())
        } else {
            SourcePoll::Idle
        }
    }
}

/// Judges the link by opening a TCP connection to a known-reachable
/// address (the gateway or any stable local service). On a host whose
/// WiFi is managed by the OS, a successful probe is the best available
/// proxy for "associated and routable".
pub struct ProbeWifiLink {
    probe_addr: String,
    handle: Handle,
    in_flight: Option<oneshot::Receiver<Result<(), String>>>,
    associated: bool,
}

impl ProbeWifiLink {
    pub fn new(handle: Handle, probe_addr: String) -> Self {
        ProbeWifiLink {
            probe_addr,
            handle,
            in_flight: None,
            associated: false,
        }
    }
}

impl WifiLink for ProbeWifiLink {
    fn begin_connect(&mut self) {
        let (tx, rx) = oneshot::channel();
        let addr = self.probe_addr.clone();
        debug!("link probe to {addr}");
        self.handle.spawn(async move {
            let result = match tokio::time::timeout(
                Duration::from_secs(5),
                tokio::net::TcpStream::connect(addr.as_str()),
            )
            .await
            {
                Ok(Ok(_stream)) => Ok(()),
                Ok(Err(err)) => Err(err.to_string()),
                Err(_) => Err("probe timed out".to_string()),
            };
            let _ = tx.send(result);
        });
        self.in_flight = Some(rx);
    }

    fn poll_connect(&mut self) -> LinkPoll {
        match poll_receiver(&mut self.in_flight) {
            SourcePoll::Idle | SourcePoll::Pending => LinkPoll::Pending,
            SourcePoll::Ready(()) => {
                self.associated = true;
                LinkPoll::Connected
            }
            SourcePoll::Failed(err) => {
                debug!("link probe failed: {err}");
                self.associated = false;
                LinkPoll::Failed
            }
        }
    }

    fn is_associated(&self) -> bool {
        self.associated
    }
}
