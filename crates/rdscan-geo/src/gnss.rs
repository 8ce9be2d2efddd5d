use std::time::Duration;
use tokio::fs::File;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, BufReader};
use tokio::sync::watch;
use tokio_serial::{SerialPortBuilderExt, SerialStream};
use tracing::{debug, info, warn};

use crate::{GeoError, GeoSnapshot, GeoState, GnssConfig};

const EOF_POLL: Duration = Duration::from_millis(500);
// NMEA 0183 caps a sentence at 82 bytes; anything far past that is line noise.
const MAX_LINE: usize = 1024;

pub enum GnssSource {
    Serial(BufReader<SerialStream>),
    File(BufReader<File>),
    Stream(Box<dyn AsyncBufRead + Send + Unpin>),
}

impl GnssSource {
    pub fn serial(dev: &str, baud: u32) -> Result<Self, GeoError> {
        let port = tokio_serial::new(dev, baud)
            .open_native_async()
            .map_err(|e| GeoError::Open { name: dev.to_string(), source: e.into() })?;
        Ok(Self::Serial(BufReader::new(port)))
    }

    pub fn file(path: &str) -> Result<Self, GeoError> {
        let f = std::fs::File::open(path)
            .map_err(|e| GeoError::Open { name: path.to_string(), source: e })?;
        Ok(Self::File(BufReader::new(File::from_std(f))))
    }

    pub fn from_config(cfg: &GnssConfig) -> Result<Self, GeoError> {
        match cfg.source.as_str() {
            "nmea-serial" => Self::serial(&cfg.device, cfg.baud),
            "nmea-file" => {
                let path = cfg.file.as_deref().unwrap_or_default();
                Self::file(path)
            }
            other => Err(GeoError::Open {
                name: other.to_string(),
                source: std::io::Error::new(std::io::ErrorKind::InvalidInput, "unknown gnss.source"),
            }),
        }
    }

    // read_until keeps partial bytes in `buf` when the future is dropped,
    // so a timed-out read resumes where it left off.
    async fn read_line_into(&mut self, buf: &mut Vec<u8>) -> std::io::Result<usize> {
        match self {
            GnssSource::Serial(r) => r.read_until(b'\n', buf).await,
            GnssSource::File(r) => r.read_until(b'\n', buf).await,
            GnssSource::Stream(r) => r.read_until(b'\n', buf).await,
        }
    }
}

/// Background reader that keeps a [`GeoSnapshot`] current.
pub struct GeoReader {
    snapshot: GeoSnapshot,
    read_timeout: Duration,
    marker: String,
}

impl GeoReader {
    pub fn new(snapshot: GeoSnapshot, read_timeout: Duration, marker: impl Into<String>) -> Self {
        Self { snapshot, read_timeout, marker: marker.into() }
    }

    pub fn from_config(snapshot: GeoSnapshot, cfg: &GnssConfig) -> Self {
        Self::new(snapshot, Duration::from_millis(cfg.read_timeout_ms.max(1)), cfg.sentence.clone())
    }

    /// Opens the configured source and reads until `stop` flips or the
    /// source fails. Any failure leaves the snapshot in `ReaderError`.
    pub async fn run(&self, cfg: &GnssConfig, stop: watch::Receiver<bool>) -> Result<(), GeoError> {
        let src = match GnssSource::from_config(cfg) {
            Ok(s) => s,
            Err(e) => {
                self.snapshot.set(GeoState::ReaderError);
                warn!("gnss: {}: {}", e, std::error::Error::source(&e).map(|s| s.to_string()).unwrap_or_default());
                return Err(e);
            }
        };
        info!("gnss: reading {} (marker {})", cfg.source, self.marker);
        self.run_source(src, "gnss", stop).await
    }

    pub async fn run_source(
        &self,
        mut src: GnssSource,
        name: &str,
        mut stop: watch::Receiver<bool>,
    ) -> Result<(), GeoError> {
        let mut buf = Vec::with_capacity(128);
        // set while the rest of an overlong line is being discarded
        let mut skipping = false;
        loop {
            if *stop.borrow() {
                return Ok(());
            }

            let read = tokio::select! {
                _ = stop.changed() => return Ok(()),
                r = tokio::time::timeout(self.read_timeout, src.read_line_into(&mut buf)) => r,
            };

            match read {
                // no data within the bound: not an error
                Err(_) => {
                    if buf.len() > MAX_LINE {
                        if !skipping {
                            warn!("gnss: {} sent {} bytes without a line end, discarding", name, buf.len());
                        }
                        buf.clear();
                        skipping = true;
                    }
                }
                Ok(Err(e)) => {
                    self.snapshot.set(GeoState::ReaderError);
                    warn!("gnss: read failed on {}: {}", name, e);
                    return Err(GeoError::Read { name: name.to_string(), source: e });
                }
                Ok(Ok(0)) => {
                    tokio::select! {
                        _ = stop.changed() => return Ok(()),
                        _ = tokio::time::sleep(EOF_POLL) => {}
                    }
                }
                Ok(Ok(_)) if skipping || buf.len() > MAX_LINE => {
                    debug!("gnss: dropped overlong line ({} bytes)", buf.len());
                    buf.clear();
                    skipping = false;
                }
                Ok(Ok(_)) => {
                    let line = String::from_utf8_lossy(&buf).into_owned();
                    buf.clear();
                    if let Some(state) = parse_fix_sentence(line.trim(), &self.marker) {
                        debug!("gnss: {:?}", state);
                        self.snapshot.set(state);
                    }
                }
            }
        }
    }
}

/// Parses one positioning sentence. Returns `None` for sentences without the
/// marker token, `NoFix` when lat/lon are absent or unreadable.
pub fn parse_fix_sentence(line: &str, marker: &str) -> Option<GeoState> {
    let start = line.find(marker)?;
    let parts: Vec<&str> = line[start..].split(',').collect();

    // [2]=lat ddmm.mmmm, [3]=N/S, [4]=lon dddmm.mmmm, [5]=E/W
    let field = |i: usize| parts.get(i).copied().unwrap_or("");
    if field(2).is_empty() || field(4).is_empty() {
        return Some(GeoState::NoFix);
    }

    match (parse_deg_min(field(2), 2, field(3)), parse_deg_min(field(4), 3, field(5))) {
        (Some(lat), Some(lon)) => Some(GeoState::Fix { lat, lon }),
        _ => Some(GeoState::NoFix),
    }
}

fn parse_deg_min(v: &str, deg_len: usize, hemi: &str) -> Option<f64> {
    let deg: f64 = v.get(..deg_len)?.parse().ok()?;
    let min: f64 = v.get(deg_len..)?.parse().ok()?;
    let mut out = deg + (min / 60.0);
    if hemi == "S" || hemi == "W" { out = -out; }
    Some(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io;
    use std::pin::Pin;
    use std::task::{Context, Poll};
    use tokio::io::{AsyncRead, AsyncWriteExt, ReadBuf};

    const GGA: &str = "$GPGGA,123519,4807.038,N,01131.000,E,1,08,0.9,545.4,M,46.9,M,,*47";
    const GGA_NO_FIX: &str = "$GPGGA,123520,,,,,0,00,99.9,,,,,,*48";

    async fn wait_for(snap: &GeoSnapshot, want: impl Fn(GeoState) -> bool) -> GeoState {
        for _ in 0..200 {
            let s = snap.get();
            if want(s) {
                return s;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        snap.get()
    }

    #[test]
    fn gga_converts_degrees_and_minutes() {
        let Some(GeoState::Fix { lat, lon }) = parse_fix_sentence(GGA, "$GPGGA") else {
            panic!("expected a fix");
        };
        assert!((lat - 48.1173).abs() < 1e-6);
        assert!((lon - 11.516_667).abs() < 1e-6);
        assert_eq!(GeoState::Fix { lat, lon }.lat_text(), "48.117300");
        assert_eq!(GeoState::Fix { lat, lon }.lon_text(), "11.516667");
    }

    #[test]
    fn empty_fields_mean_no_fix() {
        assert_eq!(parse_fix_sentence(GGA_NO_FIX, "$GPGGA"), Some(GeoState::NoFix));
        assert_eq!(parse_fix_sentence("$GPGGA,1", "$GPGGA"), Some(GeoState::NoFix));
    }

    #[test]
    fn malformed_numbers_mean_no_fix() {
        let line = "$GPGGA,123519,48x7.0,N,01131.000,E,1";
        assert_eq!(parse_fix_sentence(line, "$GPGGA"), Some(GeoState::NoFix));
    }

    #[test]
    fn other_sentences_are_ignored() {
        let rmc = "$GPRMC,123519,A,4807.038,N,01131.000,E,022.4,084.4,230394,003.1,W*6A";
        assert_eq!(parse_fix_sentence(rmc, "$GPGGA"), None);
        assert_eq!(parse_fix_sentence("", "$GPGGA"), None);
    }

    #[test]
    fn southern_and_western_hemispheres_are_negative() {
        let line = "$GPGGA,000000,3352.500,S,15112.000,W,1,05,1.2,10.0,M,,M,,*00";
        let Some(GeoState::Fix { lat, lon }) = parse_fix_sentence(line, "$GPGGA") else {
            panic!("expected a fix");
        };
        assert!((lat + 33.875).abs() < 1e-9);
        assert!((lon + 151.2).abs() < 1e-9);
    }

    #[test]
    fn marker_may_follow_line_noise() {
        let noisy = format!("\u{fffd}\u{fffd}{}", GGA);
        assert!(matches!(parse_fix_sentence(&noisy, "$GPGGA"), Some(GeoState::Fix { .. })));
    }

    #[tokio::test]
    async fn reader_tracks_stream_and_stops_on_signal() {
        let snap = GeoSnapshot::new();
        let reader = GeoReader::new(snap.clone(), Duration::from_millis(20), "$GPGGA");
        let (mut tx, rx) = tokio::io::duplex(512);
        let (stop_tx, stop_rx) = watch::channel(false);

        let task = tokio::spawn(async move {
            let src = GnssSource::Stream(Box::new(BufReader::new(rx)));
            reader.run_source(src, "duplex", stop_rx).await
        });

        tx.write_all(format!("{}\r\n", GGA_NO_FIX).as_bytes()).await.unwrap();
        tx.write_all(format!("{}\r\n", GGA).as_bytes()).await.unwrap();
        let state = wait_for(&snap, |s| matches!(s, GeoState::Fix { .. })).await;
        assert_eq!(state.lat_text(), "48.117300");

        tx.write_all(format!("{}\r\n", GGA_NO_FIX).as_bytes()).await.unwrap();
        assert_eq!(wait_for(&snap, |s| s == GeoState::NoFix).await, GeoState::NoFix);

        stop_tx.send(true).unwrap();
        let res = tokio::time::timeout(Duration::from_secs(2), task).await.unwrap().unwrap();
        assert!(res.is_ok());
    }

    #[tokio::test]
    async fn split_line_survives_read_timeout() {
        let snap = GeoSnapshot::new();
        let reader = GeoReader::new(snap.clone(), Duration::from_millis(10), "$GPGGA");
        let (mut tx, rx) = tokio::io::duplex(512);
        let (stop_tx, stop_rx) = watch::channel(false);

        let task = tokio::spawn(async move {
            let src = GnssSource::Stream(Box::new(BufReader::new(rx)));
            reader.run_source(src, "duplex", stop_rx).await
        });

        let (head, tail) = GGA.split_at(20);
        tx.write_all(head.as_bytes()).await.unwrap();
        tokio::time::sleep(Duration::from_millis(60)).await;
        tx.write_all(format!("{}\n", tail).as_bytes()).await.unwrap();

        assert!(matches!(wait_for(&snap, |s| s != GeoState::NoFix).await, GeoState::Fix { .. }));
        stop_tx.send(true).unwrap();
        task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn overlong_lines_are_discarded() {
        let snap = GeoSnapshot::new();
        let reader = GeoReader::new(snap.clone(), Duration::from_millis(10), "$GPGGA");
        let (mut tx, rx) = tokio::io::duplex(8 * 1024);
        let (stop_tx, stop_rx) = watch::channel(false);

        let task = tokio::spawn(async move {
            let src = GnssSource::Stream(Box::new(BufReader::new(rx)));
            reader.run_source(src, "duplex", stop_rx).await
        });

        // wrong baud rate: noise with no line end, spanning read timeouts
        let noise = vec![b'\xaa'; 3 * MAX_LINE];
        tx.write_all(&noise).await.unwrap();
        tokio::time::sleep(Duration::from_millis(80)).await;
        tx.write_all(format!("{}\n", GGA).as_bytes()).await.unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(snap.get(), GeoState::NoFix);

        // one complete line that is far too long
        let mut line = vec![b'x'; 2 * MAX_LINE];
        line.extend_from_slice(format!("{}\n", GGA).as_bytes());
        tx.write_all(&line).await.unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(snap.get(), GeoState::NoFix);

        tx.write_all(format!("{}\n", GGA).as_bytes()).await.unwrap();
        assert!(matches!(wait_for(&snap, |s| s != GeoState::NoFix).await, GeoState::Fix { .. }));

        stop_tx.send(true).unwrap();
        task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn replay_file_feeds_snapshot() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("drive.nmea");
        std::fs::write(&path, format!("{}\n$GPGSV,3,1,11*70\n{}\n", GGA_NO_FIX, GGA)).unwrap();

        let cfg = GnssConfig {
            source: "nmea-file".into(),
            device: String::new(),
            baud: 9600,
            file: Some(path.to_string_lossy().into_owned()),
            read_timeout_ms: 20,
            sentence: "$GPGGA".into(),
        };
        let snap = GeoSnapshot::new();
        let (stop_tx, stop_rx) = watch::channel(false);
        let task = tokio::spawn({
            let snap = snap.clone();
            async move {
                let reader = GeoReader::from_config(snap, &cfg);
                reader.run(&cfg, stop_rx).await
            }
        });

        assert!(matches!(wait_for(&snap, |s| s != GeoState::NoFix).await, GeoState::Fix { .. }));
        stop_tx.send(true).unwrap();
        task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn open_failure_reports_reader_error() {
        let cfg = GnssConfig {
            source: "nmea-file".into(),
            device: String::new(),
            baud: 9600,
            file: Some("/nonexistent/rdscan/drive.nmea".into()),
            read_timeout_ms: 20,
            sentence: "$GPGGA".into(),
        };
        let snap = GeoSnapshot::new();
        let (_stop_tx, stop_rx) = watch::channel(false);
        let err = GeoReader::from_config(snap.clone(), &cfg).run(&cfg, stop_rx).await.unwrap_err();
        assert!(matches!(err, GeoError::Open { .. }));
        assert_eq!(snap.get(), GeoState::ReaderError);
        assert_eq!(snap.get().lat_text(), "GPS Error");
    }

    struct Unplugged;

    impl AsyncRead for Unplugged {
        fn poll_read(self: Pin<&mut Self>, _: &mut Context<'_>, _: &mut ReadBuf<'_>) -> Poll<io::Result<()>> {
            Poll::Ready(Err(io::Error::new(io::ErrorKind::BrokenPipe, "unplugged")))
        }
    }

    #[tokio::test]
    async fn read_failure_reports_reader_error() {
        let snap = GeoSnapshot::new();
        snap.set(GeoState::Fix { lat: 1.0, lon: 2.0 });
        let reader = GeoReader::new(snap.clone(), Duration::from_millis(20), "$GPGGA");
        let (_stop_tx, stop_rx) = watch::channel(false);

        let src = GnssSource::Stream(Box::new(BufReader::new(Unplugged)));
        let err = reader.run_source(src, "uart", stop_rx).await.unwrap_err();
        assert!(matches!(err, GeoError::Read { .. }));
        assert_eq!(snap.get(), GeoState::ReaderError);
    }
}
