use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};

use super::{EncodeError, Encoder};
use crate::config::OutputConfig;
use crate::render::FrameSequence;

const CPU_CODEC: &str = "libx264";

/// Hardware encoders in preference order.
const GPU_CODECS: &[&str] = &[
    "h264_nvenc",
    "hevc_nvenc",
    "h264_videotoolbox",
    "hevc_videotoolbox",
    "h264_vaapi",
];

/// Codec and quality flags, fixed for the whole render.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EncodingOptions {
    pub codec: String,
    pub pix_fmt: String,
    pub crf: u32,
    pub bitrate: Option<String>,
    pub audio_bitrate: String,
}

impl EncodingOptions {
    /// Software encoding with the configured codec, or libx264 for `auto`.
    pub fn cpu(output: &OutputConfig) -> Self {
        let codec = if output.codec == "auto" {
            CPU_CODEC.to_string()
        } else {
            output.codec.clone()
        };
        Self::with_codec(output, codec)
    }

    fn with_codec(output: &OutputConfig, codec: String) -> Self {
        Self {
            codec,
            pix_fmt: output.pix_fmt.clone(),
            crf: output.crf,
            bitrate: output.bitrate.clone(),
            audio_bitrate: output.audio_bitrate.clone(),
        }
    }

    pub fn is_hardware(&self) -> bool {
        GPU_CODECS.contains(&self.codec.as_str())
    }

    fn video_args(&self) -> Vec<String> {
        let mut args = vec!["-c:v".to_string(), self.codec.clone()];
        if self.codec.contains("nvenc") {
            args.extend(["-preset", "p4", "-tune", "hq", "-rc", "vbr", "-cq", "23"].map(String::from));
        } else if self.codec.contains("videotoolbox") {
            args.extend(["-profile:v", "high", "-level:v", "4.2"].map(String::from));
        }

        if let Some(ref br) = self.bitrate {
            args.extend(["-b:v".to_string(), br.clone()]);
        } else if !self.is_hardware() {
            args.extend(["-crf".to_string(), self.crf.to_string()]);
            args.extend(["-preset".to_string(), "medium".to_string()]);
        }
        args.extend(["-pix_fmt".to_string(), self.pix_fmt.clone()]);
        args
    }
}

/// Pick the best hardware encoder listed in `ffmpeg -encoders` output.
pub fn pick_hardware_codec(encoders_listing: &str, macos: bool) -> Option<&'static str> {
    let available: Vec<&'static str> = GPU_CODECS
        .iter()
        .copied()
        .filter(|name| {
            encoders_listing
                .lines()
                .any(|line| line.split_whitespace().nth(1) == Some(*name))
        })
        .collect();

    if macos {
        if let Some(vt) = available.iter().find(|n| n.contains("videotoolbox")) {
            return Some(*vt);
        }
    }
    available.first().copied()
}

/// Muxes PNG sequences with the `ffmpeg` binary on `PATH` (or a given path).
#[derive(Clone, Debug)]
pub struct FfmpegEncoder {
    binary: PathBuf,
}

impl Default for FfmpegEncoder {
    fn default() -> Self {
        Self::new("ffmpeg")
    }
}

impl FfmpegEncoder {
    pub fn new(binary: impl Into<PathBuf>) -> Self {
        Self {
            binary: binary.into(),
        }
    }

    fn list_encoders(&self) -> Option<String> {
        let output = Command::new(&self.binary)
            .args(["-hide_banner", "-encoders"])
            .stdin(Stdio::null())
            .stderr(Stdio::null())
            .output()
            .ok()?;
        output
            .status
            .success()
            .then(|| String::from_utf8_lossy(&output.stdout).into_owned())
    }

    fn build_args(
        frames: &FrameSequence,
        audio_path: &Path,
        output_path: &Path,
        options: &EncodingOptions,
    ) -> Vec<String> {
        let pattern = frames.frame_dir.join("frame_%06d.png");
        let mut args = vec![
            "-y".to_string(),
            "-hide_banner".into(),
            "-loglevel".into(), "error".into(),
            "-framerate".into(), frames.frame_rate.to_string(),
            "-start_number".into(), "0".into(),
            "-i".into(), pattern.to_string_lossy().into_owned(),
            "-i".into(), audio_path.to_string_lossy().into_owned(),
        ];
        args.extend(options.video_args());
        args.extend([
            "-c:a".into(), "aac".into(),
            "-b:a".into(), options.audio_bitrate.clone(),
            "-shortest".into(),
            "-movflags".into(), "+faststart".into(),
            output_path.to_string_lossy().into_owned(),
        ]);
        args
    }
}

impl Encoder for FfmpegEncoder {
    fn negotiate(&self, output: &OutputConfig) -> EncodingOptions {
        if output.codec != "auto" {
            return EncodingOptions::cpu(output);
        }
        let hardware = self
            .list_encoders()
            .and_then(|listing| pick_hardware_codec(&listing, cfg!(target_os = "macos")));
        match hardware {
            Some(codec) => {
                log::info!("Using hardware encoder {}", codec);
                EncodingOptions::with_codec(output, codec.to_string())
            }
            None => {
                log::info!("No hardware encoder found, falling back to {}", CPU_CODEC);
                EncodingOptions::cpu(output)
            }
        }
    }

    fn encode(
        &self,
        frames: &FrameSequence,
        audio_path: &Path,
        output_path: &Path,
        options: &EncodingOptions,
    ) -> Result<PathBuf, EncodeError> {
        if frames.frame_count == 0 {
            return Err(EncodeError::EmptySequence(frames.frame_dir.clone()));
        }
        if let Some(parent) = output_path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }

        let args = Self::build_args(frames, audio_path, output_path, options);
        log::info!(
            "FFmpeg encoding {} frames @ {}fps, codec={}",
            frames.frame_count,
            frames.frame_rate,
            options.codec
        );
        log::debug!("ffmpeg {}", args.join(" "));

        let output = Command::new(&self.binary)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .output()
            .map_err(EncodeError::Spawn)?;

        if !output.status.success() {
            return Err(EncodeError::Failed {
                status: output.status.to_string(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        if !output_path.exists() {
            return Err(EncodeError::MissingOutput(output_path.to_path_buf()));
        }

        log::info!("FFmpeg encoding complete: {}", output_path.display());
        Ok(output_path.to_path_buf())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const LISTING: &str = "\
Encoders:
 V..... = Video
 ------
 V....D libx264              libx264 H.264 / AVC / MPEG-4 AVC
 V....D h264_vaapi           H.264/AVC (VAAPI) (codec h264)
 V....D hevc_nvenc           NVIDIA NVENC hevc encoder (codec hevc)
 V....D h264_videotoolbox    VideoToolbox H.264 Encoder (codec h264)
";

    fn sequence() -> FrameSequence {
        FrameSequence {
            frame_dir: PathBuf::from("/tmp/frames"),
            frame_count: 10,
            frame_rate: 25,
        }
    }

    #[test]
    fn prefers_nvenc_then_falls_through_the_list() {
        assert_eq!(pick_hardware_codec(LISTING, false), Some("hevc_nvenc"));
        assert_eq!(pick_hardware_codec(LISTING, true), Some("h264_videotoolbox"));
        assert_eq!(pick_hardware_codec(" V....D libx264  x", false), None);
    }

    #[test]
    fn cpu_options_use_crf() {
        let options = EncodingOptions::cpu(&OutputConfig::default());
        assert_eq!(options.codec, "libx264");
        let args = options.video_args();
        assert!(args.windows(2).any(|w| w == ["-crf", "18"]));
        assert!(args.windows(2).any(|w| w == ["-pix_fmt", "yuv420p"]));
    }

    #[test]
    fn nvenc_options_skip_crf() {
        let options = EncodingOptions::with_codec(&OutputConfig::default(), "h264_nvenc".into());
        let args = options.video_args();
        assert!(args.windows(2).any(|w| w == ["-cq", "23"]));
        assert!(!args.iter().any(|a| a == "-crf"));
    }

    #[test]
    fn args_read_the_numbered_sequence() {
        let options = EncodingOptions::cpu(&OutputConfig::default());
        let args = FfmpegEncoder::build_args(
            &sequence(),
            Path::new("beat.wav"),
            Path::new("out/video.mp4"),
            &options,
        );
        assert!(args.windows(2).any(|w| w[0] == "-framerate" && w[1] == "25"));
        assert!(args.iter().any(|a| a.ends_with("frame_%06d.png")));
        assert_eq!(args.last().unwrap(), "out/video.mp4");
        assert!(args.contains(&"-shortest".to_string()));
    }

    #[test]
    fn empty_sequence_is_rejected_before_spawning() {
        let mut frames = sequence();
        frames.frame_count = 0;
        let err = FfmpegEncoder::new("/nonexistent/ffmpeg")
            .encode(&frames, Path::new("a.wav"), Path::new("o.mp4"), &EncodingOptions::cpu(&OutputConfig::default()))
            .unwrap_err();
        assert!(matches!(err, EncodeError::EmptySequence(_)));
    }

    #[test]
    fn missing_binary_is_a_spawn_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = FfmpegEncoder::new("/nonexistent/ffmpeg")
            .encode(
                &sequence(),
                Path::new("a.wav"),
                &dir.path().join("o.mp4"),
                &EncodingOptions::cpu(&OutputConfig::default()),
            )
            .unwrap_err();
        assert!(matches!(err, EncodeError::Spawn(_)));
    }
}
