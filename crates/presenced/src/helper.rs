//! Embedding provider backed by a long-lived external helper process.
//!
//! Request frame on the helper's stdin: `u32 LE width`, `u32 LE height`,
//! then `width * height * 3` RGB bytes. Response: one JSON line on stdout,
//! `{"faces":[{"x":..,"y":..,"width":..,"height":..,"confidence":..,"descriptor":[..]}]}`
//! or `{"error":"..."}`.

use image::RgbImage;
use presence_core::{BoundingBox, Descriptor, EmbeddingProvider, FaceCandidate, ProviderError};
use serde::Deserialize;
use std::io::{BufRead, BufReader, Write};
use std::process::{Child, ChildStdin, ChildStdout, Command, Stdio};

#[derive(Debug, Deserialize)]
struct HelperResponse {
    #[serde(default)]
    faces: Vec<HelperFace>,
    #[serde(default)]
    error: Option<String>,
}

#[derive(Debug, Deserialize)]
struct HelperFace {
    x: f32,
    y: f32,
    width: f32,
    height: f32,
    confidence: f32,
    descriptor: Vec<f32>,
}

struct HelperProcess {
    child: Child,
    stdin: ChildStdin,
    stdout: BufReader<ChildStdout>,
}

pub struct HelperProvider {
    program: String,
    args: Vec<String>,
    process: Option<HelperProcess>,
}

impl HelperProvider {
    /// Build from a whitespace-separated command line.
    pub fn from_command_line(command_line: &str) -> Result<Self, ProviderError> {
        let mut parts = command_line.split_whitespace().map(str::to_string);
        let program = parts.next().ok_or_else(|| {
            ProviderError::Unavailable(
                "no extractor command configured (set PRESENCE_EXTRACTOR_COMMAND)".into(),
            )
        })?;
        Ok(Self {
            program,
            args: parts.collect(),
            process: None,
        })
    }

    fn spawn(&self) -> Result<HelperProcess, ProviderError> {
        let mut child = Command::new(&self.program)
            .args(&self.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .spawn()
            .map_err(|e| ProviderError::Unavailable(format!("{}: {e}", self.program)))?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| ProviderError::Unavailable("helper stdin not captured".into()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| ProviderError::Unavailable("helper stdout not captured".into()))?;

        tracing::info!(program = %self.program, pid = child.id(), "embedding helper started");

        Ok(HelperProcess {
            child,
            stdin,
            stdout: BufReader::new(stdout),
        })
    }

    fn exchange(process: &mut HelperProcess, image: &RgbImage) -> Result<String, ProviderError> {
        let (width, height) = image.dimensions();
        process.stdin.write_all(&width.to_le_bytes())?;
        process.stdin.write_all(&height.to_le_bytes())?;
        process.stdin.write_all(image.as_raw())?;
        process.stdin.flush()?;

        let mut line = String::new();
        let read = process.stdout.read_line(&mut line)?;
        if read == 0 {
            return Err(ProviderError::Unavailable("embedding helper exited".into()));
        }
        Ok(line)
    }

    fn stop(&mut self) {
        if let Some(mut process) = self.process.take() {
            drop(process.stdin);
            if let Err(err) = process.child.kill() {
                tracing::debug!(error = %err, "embedding helper already exited");
            }
            let _ = process.child.wait();
            tracing::info!(program = %self.program, "embedding helper stopped");
        }
    }
}

impl EmbeddingProvider for HelperProvider {
    fn name(&self) -> &str {
        &self.program
    }

    fn open(&mut self) -> Result<(), ProviderError> {
        if self.process.is_none() {
            self.process = Some(self.spawn()?);
        }
        Ok(())
    }

    fn detect(&mut self, image: &RgbImage) -> Result<Vec<FaceCandidate>, ProviderError> {
        // Restart lazily after a previous failure.
        if self.process.is_none() {
            self.process = Some(self.spawn()?);
        }
        let Some(process) = self.process.as_mut() else {
            return Err(ProviderError::Unavailable("embedding helper not running".into()));
        };

        match Self::exchange(process, image) {
            Ok(line) => parse_response(&line),
            Err(err) => {
                tracing::warn!(error = %err, "embedding helper failed; will restart on next request");
                self.stop();
                Err(err)
            }
        }
    }

    fn close(&mut self) {
        self.stop();
    }
}

impl Drop for HelperProvider {
    fn drop(&mut self) {
        self.stop();
    }
}

fn parse_response(line: &str) -> Result<Vec<FaceCandidate>, ProviderError> {
    let response: HelperResponse = serde_json::from_str(line.trim())
        .map_err(|e| ProviderError::Protocol(format!("bad helper response: {e}")))?;

    if let Some(error) = response.error {
        return Err(ProviderError::Protocol(error));
    }

    Ok(response
        .faces
        .into_iter()
        .map(|f| FaceCandidate {
            bbox: BoundingBox {
                x: f.x,
                y: f.y,
                width: f.width,
                height: f.height,
                confidence: f.confidence,
            },
            descriptor: Descriptor::new(f.descriptor),
        })
        .collect())
}
