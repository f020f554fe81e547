#![allow(dead_code)]

use std::io;
use std::os::unix::fs::PermissionsExt;
use std::os::unix::process::ExitStatusExt;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Output};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use image::{ImageBuffer, ImageFormat, Rgb};
use tempfile::TempDir;

use derivmedia_core::config::{load_config, DerivmediaConfig};
use derivmedia_core::resource::NewMedia;
use derivmedia_core::{CommandExecutor, Services, ToolInvoker};

pub type Calls = Arc<Mutex<Vec<(String, Vec<String>)>>>;

/// How the fake tools behave.
#[derive(Debug, Clone)]
pub struct Script {
    pub ffmpeg_exit: i32,
    pub convert_exit: i32,
    /// ffprobe duration; `None` makes ffprobe fail.
    pub duration: Option<f64>,
    /// Bytes written by ffmpeg instead of the ones matching the output extension.
    pub ffmpeg_output: Option<Vec<u8>>,
}

impl Default for Script {
    fn default() -> Self {
        Self {
            ffmpeg_exit: 0,
            convert_exit: 0,
            duration: Some(120.0),
            ffmpeg_output: None,
        }
    }
}

/// Stands in for the external tools: records every call and writes
/// plausible output where the real tool would.
pub struct ScriptedExecutor {
    script: Script,
    calls: Calls,
}

impl ScriptedExecutor {
    pub fn new(script: Script) -> (Arc<dyn CommandExecutor>, Calls) {
        let calls: Calls = Arc::new(Mutex::new(Vec::new()));
        let executor: Arc<dyn CommandExecutor> = Arc::new(Self {
            script,
            calls: Arc::clone(&calls),
        });
        (executor, calls)
    }

    fn ffmpeg(&self, args: &[String]) -> io::Result<i32> {
        if self.script.ffmpeg_exit != 0 {
            return Ok(self.script.ffmpeg_exit);
        }
        let output = PathBuf::from(last(args));
        if output.extension().and_then(|ext| ext.to_str()) == Some("jpg") {
            write_frame(&output)?;
            return Ok(0);
        }
        let bytes = match &self.script.ffmpeg_output {
            Some(bytes) => bytes.clone(),
            None => media_bytes(&output),
        };
        std::fs::write(&output, bytes)?;
        Ok(0)
    }

    fn ghostscript(&self, args: &[String]) -> io::Result<i32> {
        let position = args.iter().position(|arg| arg == "-o");
        let Some(output) = position.and_then(|index| args.get(index + 1)) else {
            return Ok(1);
        };
        std::fs::write(output, padded(b"%PDF-1.7\n"))?;
        Ok(0)
    }

    fn convert(&self, args: &[String]) -> io::Result<i32> {
        if self.script.convert_exit != 0 {
            return Ok(self.script.convert_exit);
        }
        let output = last(args).trim_start_matches("jpeg:");
        if output.ends_with(".pdf") {
            std::fs::write(output, padded(b"%PDF-1.4\n"))?;
        } else {
            let input = args.first().map(String::as_str).unwrap_or_default();
            std::fs::copy(input.trim_start_matches("jpeg:"), output)?;
        }
        Ok(0)
    }

    fn pdftohtml(&self, args: &[String]) -> io::Result<i32> {
        std::fs::write(
            last(args),
            b"<?xml version=\"1.0\" encoding=\"UTF-8\"?>\n<pdf2xml></pdf2xml>\n",
        )?;
        Ok(0)
    }

    fn ffprobe(&self) -> (i32, Vec<u8>) {
        match self.script.duration {
            Some(duration) => (
                0,
                format!(
                    r#"{{"streams":[{{"codec_type":"video"}},{{"codec_type":"audio"}}],"format":{{"duration":"{duration}","format_name":"mov,mp4,m4a"}}}}"#
                )
                .into_bytes(),
            ),
            None => (1, Vec::new()),
        }
    }
}

#[async_trait]
impl CommandExecutor for ScriptedExecutor {
    async fn run(&self, program: &Path, args: &[String]) -> io::Result<Output> {
        let name = program
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_default();
        self.calls
            .lock()
            .unwrap()
            .push((name.clone(), args.to_vec()));
        let (code, stdout) = match name.as_str() {
            "ffmpeg" => (self.ffmpeg(args)?, Vec::new()),
            "ffprobe" => self.ffprobe(),
            "gs" => (self.ghostscript(args)?, Vec::new()),
            "convert" => (self.convert(args)?, Vec::new()),
            "pdftohtml" => (self.pdftohtml(args)?, Vec::new()),
            _ => (127, Vec::new()),
        };
        Ok(Output {
            status: ExitStatus::from_raw(code << 8),
            stdout,
            stderr: Vec::new(),
        })
    }
}

fn last(args: &[String]) -> &str {
    args.last().map(String::as_str).unwrap_or_default()
}

fn padded(header: &[u8]) -> Vec<u8> {
    let mut bytes = header.to_vec();
    bytes.resize(header.len() + 512, b' ');
    bytes
}

fn media_bytes(output: &Path) -> Vec<u8> {
    match output.extension().and_then(|ext| ext.to_str()) {
        Some("mp3") => padded(b"ID3\x04\x00\x00\x00\x00\x00\x00"),
        Some("ogg") => padded(b"OggS\x00\x02"),
        Some("webm") => padded(b"\x1A\x45\xDF\xA3\x9F\x42\x82\x84webm"),
        Some("mp4") => padded(b"\x00\x00\x00\x20ftypisom\x00\x00\x02\x00"),
        _ => padded(b"unknown"),
    }
}

fn write_frame(path: &Path) -> io::Result<()> {
    let frame = ImageBuffer::from_fn(800, 450, |x, y| Rgb([(x % 256) as u8, (y % 256) as u8, 96]));
    frame
        .save_with_format(path, ImageFormat::Jpeg)
        .map_err(|err| io::Error::new(io::ErrorKind::Other, err.to_string()))
}

fn fixture_path(relative: &str) -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR"))
        .join("..")
        .join(relative)
}

fn adjust_config(base: &TempDir, mut config: DerivmediaConfig) -> DerivmediaConfig {
    let bin = base.path().join("bin");
    std::fs::create_dir_all(&bin).unwrap();
    for tool in ["ffmpeg", "ffprobe", "gs", "convert", "pdftohtml"] {
        let path = bin.join(tool);
        std::fs::write(&path, b"#!/bin/sh\nexit 0\n").unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
    }
    config.paths.base_dir = base.path().to_string_lossy().to_string();
    config.tools.ffmpeg = bin.join("ffmpeg");
    config.tools.ffprobe = bin.join("ffprobe");
    config.tools.ghostscript = bin.join("gs");
    config.tools.convert = bin.join("convert");
    config.tools.pdftohtml = bin.join("pdftohtml");
    config.tools.timeout_seconds = 10;
    config.tools.probe_timeout_seconds = 5;
    config
}

pub struct Fixture {
    pub dir: TempDir,
    pub services: Services,
    pub calls: Calls,
}

impl Fixture {
    pub fn new() -> Self {
        Self::with_script(Script::default())
    }

    pub fn with_script(script: Script) -> Self {
        let dir = TempDir::new().unwrap();
        let config = load_config(fixture_path("configs/derivmedia.toml")).unwrap();
        let config = adjust_config(&dir, config);
        let (executor, calls) = ScriptedExecutor::new(script);
        let invoker = ToolInvoker::new(config.tools.clone()).with_executor(executor);
        let services = Services::with_invoker(config, invoker).unwrap();
        services.initialize().unwrap();
        Self {
            dir,
            services,
            calls,
        }
    }

    pub fn root(&self) -> PathBuf {
        self.services.config.storage_root()
    }

    /// New item holding one uploaded original with the given content.
    pub fn upload(&self, storage_id: &str, extension: &str, media_type: &str, content: &[u8]) -> (i64, i64) {
        let item_id = self
            .services
            .repository
            .insert_item(Some("Fixture item"), &[])
            .unwrap();
        let media_id = self.attach(item_id, storage_id, extension, media_type, content);
        (item_id, media_id)
    }

    pub fn attach(
        &self,
        item_id: i64,
        storage_id: &str,
        extension: &str,
        media_type: &str,
        content: &[u8],
    ) -> i64 {
        let original = self
            .root()
            .join("original")
            .join(format!("{storage_id}.{extension}"));
        std::fs::write(&original, content).unwrap();
        let media = NewMedia {
            size: Some(content.len() as u64),
            ..NewMedia::upload(item_id, storage_id, extension, media_type)
        };
        self.services.repository.insert_media(&media).unwrap()
    }

    pub fn calls_to(&self, tool: &str) -> Vec<Vec<String>> {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|(name, _)| name == tool)
            .map(|(_, args)| args.clone())
            .collect()
    }
}
