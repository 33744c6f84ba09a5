use clockface_core::{DetectOptions, DetectorError, FaceDetection, FaceDetector};
use std::io::{self, Write};
use std::process::{Command, Stdio};

/// Runs an external detector executable once per frame.
///
/// Protocol: the encoded image is written to stdin; the process prints a
/// JSON [`FaceDetection`] on stdout, or `null` when no face is present.
/// `--skip-frontality` and `--skip-quality` are appended when requested.
pub struct CommandFaceDetector {
    program: String,
    args: Vec<String>,
}

impl CommandFaceDetector {
    pub fn new(program: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
        }
    }
}

impl FaceDetector for CommandFaceDetector {
    fn detect(&self, image: &[u8], options: DetectOptions) -> Result<FaceDetection, DetectorError> {
        if image.is_empty() {
            return Err(DetectorError::InvalidFrame("empty image".into()));
        }

        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        if options.skip_frontality_check {
            cmd.arg("--skip-frontality");
        }
        if options.skip_quality_check {
            cmd.arg("--skip-quality");
        }

        let mut child = cmd
            .spawn()
            .map_err(|e| DetectorError::Backend(format!("spawning {}: {e}", self.program)))?;

        // stdin is fed from its own thread while stdout and stderr drain here;
        // a detector that writes before it has read the whole frame would
        // otherwise fill a pipe and stall both sides.
        let stdin = child.stdin.take();
        let (output, written) = std::thread::scope(|scope| {
            let writer = stdin.map(|mut stdin| scope.spawn(move || stdin.write_all(image)));
            let output = child.wait_with_output();
            let written = match writer {
                Some(handle) => handle
                    .join()
                    .unwrap_or_else(|_| Err(io::Error::other("stdin writer panicked"))),
                None => Ok(()),
            };
            (output, written)
        });

        let output = output
            .map_err(|e| DetectorError::Backend(format!("waiting for {}: {e}", self.program)))?;
        match written {
            // A detector may legitimately answer without reading the whole frame.
            Err(e) if e.kind() != io::ErrorKind::BrokenPipe => {
                return Err(DetectorError::Backend(format!("writing frame: {e}")));
            }
            _ => {}
        }

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(DetectorError::Backend(format!(
                "{} exited with {}: {}",
                self.program,
                output.status,
                stderr.trim()
            )));
        }

        let detection: Option<FaceDetection> = serde_json::from_slice(&output.stdout)
            .map_err(|e| DetectorError::Backend(format!("unreadable detector output: {e}")))?;
        detection.ok_or(DetectorError::NoFaceFound)
    }
}
