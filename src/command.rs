/// Recorder command line: per-platform ffmpeg screen-capture arguments.
use crate::config::RecorderConfig;
use std::path::Path;

/// Screen-capture input backend understood by ffmpeg.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CaptureBackend {
    GdiGrab,
    AvFoundation,
    X11Grab,
}

impl CaptureBackend {
    /// The backend for the platform this binary was built for.
    pub fn native() -> Self {
        if cfg!(windows) {
            CaptureBackend::GdiGrab
        } else if cfg!(target_os = "macos") {
            CaptureBackend::AvFoundation
        } else {
            CaptureBackend::X11Grab
        }
    }
}

/// Build the full argument list (without the program) for one recording.
pub fn build_args(config: &RecorderConfig, backend: CaptureBackend, output: &Path) -> Vec<String> {
    let mut args: Vec<String> = Vec::new();
    let mut push = |items: &[&str]| args.extend(items.iter().map(|s| s.to_string()));

    let fps = config.fps.to_string();
    match backend {
        CaptureBackend::GdiGrab => push(&["-f", "gdigrab", "-framerate", &fps]),
        CaptureBackend::AvFoundation => push(&["-f", "avfoundation", "-framerate", &fps]),
        CaptureBackend::X11Grab => push(&["-f", "x11grab", "-framerate", &fps]),
    }

    let (x_flag, y_flag) = match backend {
        CaptureBackend::GdiGrab => (Some("-offset_x"), Some("-offset_y")),
        CaptureBackend::X11Grab => (Some("-grab_x"), Some("-grab_y")),
        CaptureBackend::AvFoundation => (None, None),
    };
    if let (Some(flag), Some(x)) = (x_flag, config.offset_x) {
        push(&[flag, &x.to_string()]);
    }
    if let (Some(flag), Some(y)) = (y_flag, config.offset_y) {
        push(&[flag, &y.to_string()]);
    }
    if let Some(size) = &config.video_size {
        push(&["-video_size", size]);
    }

    match backend {
        CaptureBackend::GdiGrab => push(&["-i", "desktop"]),
        CaptureBackend::AvFoundation => push(&[
            "-i",
            &format!("{}:none", config.video_device),
            "-capture_cursor",
            "1",
            "-capture_mouse_clicks",
            "1",
        ]),
        CaptureBackend::X11Grab => push(&["-i", &config.video_device]),
    }

    push(&["-vcodec", "libx264", "-b:v", &config.bitrate.to_string()]);
    if let Some(scale) = &config.scale {
        push(&["-vf", &format!("scale={scale}")]);
    }
    push(&["-preset", &config.preset]);

    args.extend(config.extra_args.iter().cloned());
    args.push(output.to_string_lossy().into_owned());
    args
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_x11grab_defaults() {
        let config = RecorderConfig {
            video_device: "0.0".to_string(),
            ..Default::default()
        };
        let args = build_args(&config, CaptureBackend::X11Grab, Path::new("/out/tmp_1.mp4"));
        assert_eq!(
            args,
            vec![
                "-f", "x11grab", "-framerate", "5", "-i", "0.0", "-vcodec", "libx264", "-b:v",
                "2000000", "-preset", "ultrafast", "/out/tmp_1.mp4",
            ]
        );
    }

    #[test]
    fn test_gdigrab_offsets_and_size() {
        let config = RecorderConfig {
            offset_x: Some(10),
            offset_y: Some(20),
            video_size: Some("1920x1080".to_string()),
            ..Default::default()
        };
        let args = build_args(&config, CaptureBackend::GdiGrab, Path::new("out.mp4"));
        let joined = args.join(" ");
        assert!(joined.starts_with("-f gdigrab -framerate 5 -offset_x 10 -offset_y 20"));
        assert!(joined.contains("-video_size 1920x1080 -i desktop"));
    }

    #[test]
    fn test_avfoundation_ignores_offsets() {
        let config = RecorderConfig {
            video_device: "default".to_string(),
            offset_x: Some(10),
            ..Default::default()
        };
        let args = build_args(&config, CaptureBackend::AvFoundation, Path::new("out.mp4"));
        let joined = args.join(" ");
        assert!(!joined.contains("offset"));
        assert!(joined.contains("-i default:none -capture_cursor 1 -capture_mouse_clicks 1"));
    }

    #[test]
    fn test_scale_and_extra_args_precede_output() {
        let config = RecorderConfig {
            scale: Some("1280:-1".to_string()),
            extra_args: vec!["-pix_fmt".to_string(), "yuv420p".to_string()],
            ..Default::default()
        };
        let args = build_args(&config, CaptureBackend::X11Grab, Path::new("out.mp4"));
        let n = args.len();
        assert_eq!(&args[n - 3..], &["-pix_fmt", "yuv420p", "out.mp4"]);
        assert!(args.join(" ").contains("-vf scale=1280:-1 -preset ultrafast"));
    }
}
