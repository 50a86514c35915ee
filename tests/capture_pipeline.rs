//! End-to-end runs over the virtual capture device

use image::ImageFormat;
use std::fs;
use std::io;
use tempfile::TempDir;
use webcam_streamer::capture::{
    negotiate_device, negotiate_with, CaptureRequest, CaptureSource, DeviceError,
    NegotiationError, PixelEncoding, VirtualDevice, VirtualDeviceSpec, VirtualFormat,
};
use webcam_streamer::codec::Quality;
use webcam_streamer::filter::{self, Filter, YuyvTranscoder};
use webcam_streamer::output::FileSink;
use webcam_streamer::{CaptureFormat, RunFlag, Session, StopReason};

const MB: usize = 1024 * 1024;

/// Packed 4:2:2 frame with a diagonal luma ramp and flat chroma.
fn yuyv_frame(width: u32, height: u32) -> Vec<u8> {
    let mut frame = Vec::with_capacity((width * height * 2) as usize);
    for y in 0..height {
        for x in (0..width).step_by(2) {
            frame.push(((x + y) % 256) as u8);
            frame.push(128);
            frame.push(((x + 1 + y) % 256) as u8);
            frame.push(128);
        }
    }
    frame
}

fn transcode(width: u32, height: u32) -> Vec<u8> {
    let format = CaptureFormat::new(PixelEncoding::Yuyv, width, height, 0);
    let mut transcoder = YuyvTranscoder::new(&format, Quality::EncoderDefault).unwrap();
    let raw = yuyv_frame(width, height);
    let mut filtered = transcoder.put_frame(&raw).unwrap();

    let mut jpeg = Vec::new();
    loop {
        let chunk = filtered.read();
        if chunk.is_empty() {
            break;
        }
        jpeg.extend_from_slice(chunk);
    }
    jpeg
}

/// Drops every DHT segment, the way MJPEG webcams send frames.
fn strip_dht(jpeg: &[u8]) -> Vec<u8> {
    let mut out = jpeg[..2].to_vec();
    let mut pos = 2;
    loop {
        let marker = jpeg[pos + 1];
        if marker == 0xDA {
            out.extend_from_slice(&jpeg[pos..]);
            return out;
        }
        let len = u16::from_be_bytes([jpeg[pos + 2], jpeg[pos + 3]]) as usize;
        if marker != 0xC4 {
            out.extend_from_slice(&jpeg[pos..pos + 2 + len]);
        }
        pos += 2 + len;
    }
}

fn has_dht(jpeg: &[u8]) -> bool {
    jpeg.windows(2).any(|w| w == [0xFF, 0xC4])
}

/// Height and width from the baseline frame header.
fn sof0_dimensions(jpeg: &[u8]) -> (u16, u16) {
    let sof = jpeg
        .windows(2)
        .position(|w| w == [0xFF, 0xC0])
        .expect("baseline frame header");
    (
        u16::from_be_bytes([jpeg[sof + 5], jpeg[sof + 6]]),
        u16::from_be_bytes([jpeg[sof + 7], jpeg[sof + 8]]),
    )
}

fn request(budget: usize) -> CaptureRequest {
    CaptureRequest {
        memory_budget: budget,
        ..Default::default()
    }
}

#[test]
fn test_yuyv_camera_to_files() {
    let device = VirtualDevice::new(VirtualDeviceSpec::yuyv(640, 480))
        .with_frames([yuyv_frame(640, 480), yuyv_frame(640, 480)]);
    let counters = device.counters();
    let mut device = Some(device);

    // /dev/video0 does not exist, /dev/video1 is the camera
    let capture = negotiate_with(&request(8 * MB), |path| match path {
        "/dev/video1" => device
            .take()
            .ok_or_else(|| DeviceError::Rejected("opened twice".to_string())),
        _ => Err(DeviceError::io("open", io::ErrorKind::NotFound.into())),
    })
    .unwrap();

    assert_eq!(capture.path(), "/dev/video1");
    assert_eq!(capture.format().encoding, PixelEncoding::Yuyv);
    assert_eq!(capture.ring().len(), 13);

    let dir = TempDir::new().unwrap();
    let filter = filter::for_format(&capture.format(), Quality::Fixed(80)).unwrap();
    let sink = FileSink::create(dir.path()).unwrap();

    let report = Session::new(capture, filter, Box::new(sink)).run(&RunFlag::new());
    assert_eq!(report.reason, StopReason::EndOfStream);
    assert_eq!(report.stats.frames, 2);

    for name in ["00000000.jpg", "00000001.jpg"] {
        let jpeg = fs::read(dir.path().join(name)).unwrap();
        let image = image::load_from_memory_with_format(&jpeg, ImageFormat::Jpeg)
            .unwrap()
            .to_luma8();
        assert_eq!(image.dimensions(), (640, 480));
        let corner = image.get_pixel(0, 0)[0];
        assert!(corner < 16, "corner luma {}", corner);
    }
    assert!(!dir.path().join("00000002.jpg").exists());

    let state = counters.snapshot();
    assert!(state.closed);
    assert!(!state.streaming);
    assert_eq!(state.mapped, 13);
    assert_eq!(state.unmapped, 13);
    assert_eq!(state.buffers_granted, 0);
}

#[test]
fn test_explicit_size_only_offered_as_yuyv() {
    let spec = VirtualDeviceSpec::new(vec![
        VirtualFormat::new(PixelEncoding::Mjpeg, 1280, 720),
        VirtualFormat::new(PixelEncoding::Jpeg, 320, 240),
        VirtualFormat::new(PixelEncoding::Yuyv, 640, 480),
    ]);
    let device = VirtualDevice::new(spec).with_frames([yuyv_frame(640, 480), yuyv_frame(640, 480)]);
    let counters = device.counters();

    let request = CaptureRequest {
        width: 640,
        height: 480,
        memory_budget: 8 * MB,
        ..Default::default()
    };
    let capture = negotiate_device(device, "/dev/video0", &request).unwrap();
    let format = capture.format();
    assert_eq!(format.encoding, PixelEncoding::Yuyv);
    assert_eq!((format.width, format.height, format.stride), (640, 480, 1280));
    // JPEG and MJPEG were tried first
    assert_eq!(counters.snapshot().format_sets, 3);

    let dir = TempDir::new().unwrap();
    let filter = filter::for_format(&format, Quality::EncoderDefault).unwrap();
    let sink = FileSink::create(dir.path()).unwrap();

    let report = Session::new(capture, filter, Box::new(sink)).run(&RunFlag::new());
    assert_eq!(report.reason, StopReason::EndOfStream);
    assert_eq!(report.stats.frames, 2);

    for name in ["00000000.jpg", "00000001.jpg"] {
        let jpeg = fs::read(dir.path().join(name)).unwrap();
        assert_eq!(&jpeg[..2], &[0xFF, 0xD8]);
        assert_eq!(sof0_dimensions(&jpeg), (480, 640));
    }
}

#[test]
fn test_mjpeg_camera_gets_huffman_tables() {
    let frame = strip_dht(&transcode(64, 48));
    assert!(!has_dht(&frame));

    let device = VirtualDevice::new(VirtualDeviceSpec::mjpeg(64, 48)).with_frames([frame.clone()]);
    let capture = negotiate_device(device, "/dev/video0", &request(MB)).unwrap();
    assert_eq!(capture.format().encoding, PixelEncoding::Mjpeg);

    let dir = TempDir::new().unwrap();
    let filter = filter::for_format(&capture.format(), Quality::EncoderDefault).unwrap();
    let sink = FileSink::create(dir.path()).unwrap();

    let report = Session::new(capture, filter, Box::new(sink)).run(&RunFlag::new());
    assert_eq!(report.stats.frames, 1);

    let jpeg = fs::read(dir.path().join("00000000.jpg")).unwrap();
    assert!(has_dht(&jpeg));
    assert!(jpeg.len() > frame.len());
    let image = image::load_from_memory_with_format(&jpeg, ImageFormat::Jpeg).unwrap();
    assert_eq!(image.to_luma8().dimensions(), (64, 48));
}

#[test]
fn test_device_without_streaming_is_rejected() {
    let mut spec = VirtualDeviceSpec::yuyv(320, 240);
    spec.streaming = false;
    let device = VirtualDevice::new(spec);
    let counters = device.counters();

    let result = negotiate_device(device, "/dev/video0", &request(8 * MB));
    match result {
        Err(NegotiationError::MissingCapabilities { path, missing }) => {
            assert_eq!(path, "/dev/video0");
            assert_eq!(missing, "streaming I/O");
        }
        Err(e) => panic!("unexpected error: {}", e),
        Ok(_) => panic!("negotiation should fail"),
    }

    let state = counters.snapshot();
    assert_eq!(state.request_calls, 0);
    assert_eq!(state.mapped, 0);
    assert!(state.closed);
}

#[test]
fn test_scan_skips_unusable_candidate() {
    let mut broken = VirtualDeviceSpec::yuyv(320, 240);
    broken.video_capture = false;
    let mut devices = vec![
        VirtualDevice::new(VirtualDeviceSpec::yuyv(320, 240)),
        VirtualDevice::new(broken),
    ];

    let capture = negotiate_with(&request(MB), |_| {
        devices
            .pop()
            .ok_or_else(|| DeviceError::io("open", io::ErrorKind::NotFound.into()))
    })
    .unwrap();
    assert_eq!(capture.path(), "/dev/video1");
}

#[test]
fn test_no_candidate_found() {
    let result = negotiate_with::<VirtualDevice, _>(&request(MB), |_| {
        Err(DeviceError::io("open", io::ErrorKind::NotFound.into()))
    });
    assert!(matches!(result, Err(NegotiationError::NotFound)));
}

#[test]
fn test_small_budget_still_gets_two_buffers() {
    let device = VirtualDevice::new(VirtualDeviceSpec::yuyv(640, 480));
    let counters = device.counters();

    let capture = negotiate_device(device, "/dev/video0", &request(100_000)).unwrap();
    assert_eq!(capture.ring().len(), 2);
    assert_eq!(counters.snapshot().buffers_granted, 2);
}

#[test]
fn test_requested_size_is_negotiated() {
    let spec = VirtualDeviceSpec::new(vec![
        VirtualFormat::new(PixelEncoding::Yuyv, 1280, 720),
        VirtualFormat::new(PixelEncoding::Yuyv, 320, 240),
    ]);
    let request = CaptureRequest {
        width: 320,
        height: 240,
        frame_rate: 15,
        memory_budget: MB,
        ..Default::default()
    };

    let device = VirtualDevice::new(spec);
    let counters = device.counters();
    let capture = negotiate_device(device, "/dev/video0", &request).unwrap();

    let format = capture.format();
    assert_eq!((format.width, format.height), (320, 240));
    assert_eq!(format.stride, 640);
    assert_eq!(counters.snapshot().frame_interval, Some((1, 15)));
}
