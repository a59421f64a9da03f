use anyhow::{anyhow, Result};
use std::io::{Cursor, Read, Write};
use std::net::TcpStream;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use image::{DynamicImage, ImageFormat, RgbImage};

use drive_ingest::config::BusyPolicy;
use drive_ingest::{IngestServer, IngestdConfig, ServerHandle, SessionReport};

const REPORT_WAIT: Duration = Duration::from_secs(10);

fn jpeg_bytes(seed: u8) -> Vec<u8> {
    let img = RgbImage::from_fn(32, 16, |x, y| image::Rgb([seed, (x * 4) as u8, (y * 8) as u8]));
    let mut out = Cursor::new(Vec::new());
    DynamicImage::ImageRgb8(img)
        .write_to(&mut out, ImageFormat::Jpeg)
        .expect("encode jpeg");
    out.into_inner()
}

fn framed(payload: &[u8]) -> Vec<u8> {
    let mut out = (payload.len() as u32).to_le_bytes().to_vec();
    out.extend_from_slice(payload);
    out
}

fn wire_frame(seed: u8, control: &str) -> Vec<u8> {
    let mut out = Vec::new();
    for offset in 0..3u8 {
        out.extend(framed(&jpeg_bytes(seed.wrapping_add(offset))));
    }
    out.extend_from_slice(control.as_bytes());
    out
}

struct Dataset {
    _dir: tempfile::TempDir,
    image_dir: PathBuf,
    log_path: PathBuf,
}

impl Dataset {
    fn new() -> Result<Self> {
        let dir = tempfile::tempdir()?;
        let image_dir = dir.path().join("images");
        let log_path = dir.path().join("controls.csv");
        Ok(Self {
            _dir: dir,
            image_dir,
            log_path,
        })
    }

    fn config(&self) -> IngestdConfig {
        IngestdConfig {
            listen_addr: "127.0.0.1:0".to_string(),
            image_dir: self.image_dir.clone(),
            log_path: self.log_path.clone(),
            read_timeout: Some(Duration::from_secs(5)),
            ..IngestdConfig::default()
        }
    }

    fn lines(&self) -> Result<Vec<String>> {
        Ok(std::fs::read_to_string(&self.log_path)?
            .lines()
            .map(str::to_string)
            .collect())
    }

    fn wait_for_rows(&self, rows: usize) -> Result<()> {
        let deadline = Instant::now() + REPORT_WAIT;
        while Instant::now() < deadline {
            if self.lines()?.len() > rows {
                return Ok(());
            }
            std::thread::sleep(Duration::from_millis(10));
        }
        Err(anyhow!("timed out waiting for {} rows", rows))
    }
}

fn next_report(handle: &ServerHandle) -> Result<SessionReport> {
    handle
        .next_report(REPORT_WAIT)
        .ok_or_else(|| anyhow!("no session report"))
}

fn assert_decodes(dir: &Path, file: &str) -> Result<()> {
    let bytes = std::fs::read(dir.join(file))?;
    image::load_from_memory(&bytes)?;
    Ok(())
}

#[test]
fn three_frames_become_three_rows() -> Result<()> {
    let data = Dataset::new()?;
    let handle = IngestServer::new(data.config()).spawn()?;

    {
        let mut client = TcpStream::connect(handle.local_addr())?;
        client.write_all(&wire_frame(1, "0.1,0.8,0.0\n"))?;
        client.write_all(&wire_frame(2, "-0.25,0.5,0.0\n"))?;
        client.write_all(&wire_frame(3, "0.0,0.0,1.0\n"))?;
    }

    let report = next_report(&handle)?;
    assert!(report.outcome.is_clean(), "{report}");
    assert_eq!(report.frames_committed, 3);

    let lines = data.lines()?;
    assert_eq!(lines.len(), 4);
    assert_eq!(lines[0], "center_frame,left_frame,right_frame,steer,throttle,brake");
    assert_eq!(
        lines[2],
        "center_00001.jpg,left_00001.jpg,right_00001.jpg,-0.25,0.5,0.0"
    );
    for (id, line) in lines[1..].iter().enumerate() {
        let fields: Vec<&str> = line.split(',').collect();
        assert_eq!(fields.len(), 6);
        assert_eq!(fields[0], format!("center_{:05}.jpg", id));
        for file in &fields[..3] {
            assert_decodes(&data.image_dir, file)?;
        }
    }

    let summary = handle.stop()?;
    assert_eq!(summary.sessions, 1);
    assert_eq!(summary.frames_committed, 3);
    Ok(())
}

#[test]
fn truncated_frame_fails_session_but_server_keeps_accepting() -> Result<()> {
    let data = Dataset::new()?;
    let handle = IngestServer::new(data.config()).spawn()?;

    {
        let mut client = TcpStream::connect(handle.local_addr())?;
        client.write_all(&wire_frame(1, "0.1,0.8,0.0\n"))?;
        let center = framed(&jpeg_bytes(9));
        client.write_all(&center[..center.len() / 2])?;
    }
    let report = next_report(&handle)?;
    assert_eq!(report.frames_committed, 1);
    let err = report.outcome.error().expect("session should fail");
    assert_eq!(err.code(), "TRUNCATED_FRAME");
    assert_eq!(data.lines()?.len(), 2);

    {
        let mut client = TcpStream::connect(handle.local_addr())?;
        client.write_all(&wire_frame(4, "0.3,0.3,0.0\n"))?;
    }
    let report = next_report(&handle)?;
    assert!(report.outcome.is_clean());
    assert_eq!(report.frames_committed, 1);

    let lines = data.lines()?;
    assert_eq!(lines.len(), 3);
    assert!(lines[2].starts_with("center_00000.jpg,"));

    let summary = handle.stop()?;
    assert_eq!(summary.sessions, 2);
    assert_eq!(summary.failed_sessions, 1);
    Ok(())
}

#[test]
fn stalled_sender_times_out_as_truncation() -> Result<()> {
    let data = Dataset::new()?;
    let cfg = IngestdConfig {
        read_timeout: Some(Duration::from_millis(200)),
        ..data.config()
    };
    let handle = IngestServer::new(cfg).spawn()?;

    let mut client = TcpStream::connect(handle.local_addr())?;
    client.write_all(&[0x10, 0x00])?;
    let report = next_report(&handle)?;
    let err = report.outcome.error().expect("session should fail");
    assert_eq!(err.code(), "TRUNCATED_FRAME");
    assert_eq!(report.frames_committed, 0);
    drop(client);

    handle.stop()?;
    Ok(())
}

#[test]
fn corrupt_image_and_bad_controls_do_not_end_session() -> Result<()> {
    let data = Dataset::new()?;
    let handle = IngestServer::new(data.config()).spawn()?;

    {
        let mut client = TcpStream::connect(handle.local_addr())?;
        let mut corrupt = Vec::new();
        corrupt.extend(framed(&jpeg_bytes(1)));
        let mut bad = vec![0xFF, 0xD8, 0xFF, 0xD9];
        bad.extend_from_slice(&[0u8; 60]);
        corrupt.extend(framed(&bad));
        corrupt.extend(framed(&jpeg_bytes(3)));
        corrupt.extend_from_slice(b"0.9,0.9,0.0\n");
        client.write_all(&corrupt)?;
        client.write_all(&wire_frame(5, "fast,left,now\n"))?;
        client.write_all(&wire_frame(6, "0.2,0.4,0.0\n"))?;
    }

    let report = next_report(&handle)?;
    assert!(report.outcome.is_clean(), "{report}");
    assert_eq!(report.frames_committed, 2);
    assert_eq!(report.corrupt_frames, 1);
    assert_eq!(report.control_parse_errors, 1);

    let lines = data.lines()?;
    assert_eq!(lines.len(), 3);
    assert_eq!(
        lines[1],
        "center_00000.jpg,left_00000.jpg,right_00000.jpg,0.0,0.0,0.0"
    );
    assert!(lines[2].starts_with("center_00001.jpg,"));
    assert!(lines[2].ends_with(",0.2,0.4,0.0"));

    handle.stop()?;
    Ok(())
}

#[test]
fn second_client_is_rejected_while_busy() -> Result<()> {
    let data = Dataset::new()?;
    let handle = IngestServer::new(data.config()).spawn()?;

    let mut first = TcpStream::connect(handle.local_addr())?;
    first.write_all(&wire_frame(1, "0.0,1.0,0.0\n"))?;
    data.wait_for_rows(1)?;

    let mut second = TcpStream::connect(handle.local_addr())?;
    second.set_read_timeout(Some(REPORT_WAIT))?;
    let mut buf = [0u8; 1];
    let closed = matches!(second.read(&mut buf), Ok(0) | Err(_));
    assert!(closed, "rejected client should see the connection close");

    first.write_all(&wire_frame(2, "0.0,1.0,0.0\n"))?;
    drop(first);
    let report = next_report(&handle)?;
    assert_eq!(report.frames_committed, 2);

    let summary = handle.stop()?;
    assert_eq!(summary.sessions, 1);
    assert_eq!(summary.rejected_connections, 1);
    assert_eq!(data.lines()?.len(), 3);
    Ok(())
}

#[test]
fn queued_client_is_served_after_active_session() -> Result<()> {
    let data = Dataset::new()?;
    let cfg = IngestdConfig {
        busy_policy: BusyPolicy::Queue,
        ..data.config()
    };
    let handle = IngestServer::new(cfg).spawn()?;

    let mut first = TcpStream::connect(handle.local_addr())?;
    first.write_all(&wire_frame(1, "0.0,1.0,0.0\n"))?;
    data.wait_for_rows(1)?;

    {
        let mut second = TcpStream::connect(handle.local_addr())?;
        second.write_all(&wire_frame(7, "0.5,0.5,0.0\n"))?;
    }
    std::thread::sleep(Duration::from_millis(200));
    assert_eq!(data.lines()?.len(), 2, "queued client must wait its turn");

    drop(first);
    assert_eq!(next_report(&handle)?.frames_committed, 1);
    let queued = next_report(&handle)?;
    assert!(queued.outcome.is_clean(), "{queued}");
    assert_eq!(queued.frames_committed, 1);

    let lines = data.lines()?;
    assert_eq!(lines.len(), 3);
    assert!(lines[2].ends_with(",0.5,0.5,0.0"));

    let summary = handle.stop()?;
    assert_eq!(summary.sessions, 2);
    assert_eq!(summary.rejected_connections, 0);
    Ok(())
}

#[test]
fn stop_interrupts_active_session() -> Result<()> {
    let data = Dataset::new()?;
    let handle = IngestServer::new(data.config()).spawn()?;

    let mut client = TcpStream::connect(handle.local_addr())?;
    client.write_all(&wire_frame(1, "0.1,0.2,0.0\n"))?;
    let center = framed(&jpeg_bytes(2));
    client.write_all(&center[..center.len() / 2])?;
    data.wait_for_rows(1)?;
    std::thread::sleep(Duration::from_millis(200));

    let summary = handle.stop()?;
    assert_eq!(summary.sessions, 1);
    assert_eq!(summary.failed_sessions, 1);
    assert_eq!(summary.frames_committed, 1);
    assert_eq!(data.lines()?.len(), 2);
    assert!(!data.image_dir.join("center_00001.jpg").exists());
    drop(client);
    Ok(())
}

#[test]
fn restart_appends_without_second_header() -> Result<()> {
    let data = Dataset::new()?;
    for seed in [1u8, 2] {
        let handle = IngestServer::new(data.config()).spawn()?;
        {
            let mut client = TcpStream::connect(handle.local_addr())?;
            client.write_all(&wire_frame(seed, "0.1,0.1,0.0\n"))?;
        }
        next_report(&handle)?;
        handle.stop()?;
    }

    let lines = data.lines()?;
    assert_eq!(lines.len(), 3);
    let headers = lines
        .iter()
        .filter(|line| line.starts_with("center_frame"))
        .count();
    assert_eq!(headers, 1);

    let report = drive_ingest::audit(&data.image_dir, &data.log_path)?;
    assert_eq!(report.sessions, 2);
    assert!(report.is_clean(), "{report:?}");
    Ok(())
}

#[test]
fn session_cap_stops_acceptor() -> Result<()> {
    let data = Dataset::new()?;
    let cfg = IngestdConfig {
        max_sessions: Some(1),
        ..data.config()
    };
    let handle = IngestServer::new(cfg).spawn()?;
    {
        let mut client = TcpStream::connect(handle.local_addr())?;
        client.write_all(&wire_frame(1, "0.0,0.5,0.0\n"))?;
    }
    let summary = handle.wait()?;
    assert_eq!(summary.sessions, 1);
    assert_eq!(summary.frames_committed, 1);
    Ok(())
}

#[test]
fn bind_failure_is_reported_before_accepting() -> Result<()> {
    let data = Dataset::new()?;
    let first = IngestServer::new(data.config()).spawn()?;
    let cfg = IngestdConfig {
        listen_addr: first.local_addr().to_string(),
        ..data.config()
    };
    let err = IngestServer::new(cfg).spawn().unwrap_err();
    let ingest = err
        .downcast_ref::<drive_ingest::IngestError>()
        .expect("bind error");
    assert_eq!(ingest.code(), "BIND_FAILURE");
    first.stop()?;
    Ok(())
}
