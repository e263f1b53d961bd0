use std::io::Read;
use std::path::Path;
use std::process::{Child, ChildStderr, ChildStdout, Command, Stdio};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use anyhow::{anyhow, Context, Result};
use serde::Deserialize;

use crate::classify::{EmotionBackend, FaceEmotion};

/// Runs an external classifier program once per image.
///
/// The image path is appended as the last argument. The program must print
/// JSON on stdout: either a list of faces or a single face, each shaped like
/// `{"dominant_emotion": "happy", "emotion": {"happy": 91.2, ...}}`. An empty
/// list means no face was found. A non-zero exit status is a failure. A
/// program still running after `timeout` is killed.
pub struct CommandBackend {
    program: String,
    args: Vec<String>,
    timeout: Duration,
}

const EXIT_POLL: Duration = Duration::from_millis(20);

#[derive(Deserialize)]
#[serde(untagged)]
enum CommandOutput {
    Faces(Vec<FaceEmotion>),
    Face(FaceEmotion),
}

impl CommandBackend {
    pub fn new(program: &str, args: Vec<String>, timeout: Duration) -> Self {
        Self {
            program: program.to_string(),
            args,
            timeout,
        }
    }

    fn wait_or_kill(&self, child: &mut Child) -> Result<std::process::ExitStatus> {
        let deadline = Instant::now() + self.timeout;
        loop {
            if let Some(status) = child
                .try_wait()
                .with_context(|| format!("wait for classifier {}", self.program))?
            {
                return Ok(status);
            }
            if Instant::now() >= deadline {
                let _ = child.kill();
                let _ = child.wait();
                return Err(anyhow!(
                    "classifier {} timed out after {:?}; killed",
                    self.program,
                    self.timeout
                ));
            }
            std::thread::sleep(EXIT_POLL);
        }
    }
}

fn drain<R: Read + Send + 'static>(pipe: Option<R>) -> JoinHandle<Vec<u8>> {
    std::thread::spawn(move || {
        let mut buf = Vec::new();
        if let Some(mut pipe) = pipe {
            let _ = pipe.read_to_end(&mut buf);
        }
        buf
    })
}

fn collect(reader: JoinHandle<Vec<u8>>) -> Vec<u8> {
    reader.join().unwrap_or_default()
}

impl EmotionBackend for CommandBackend {
    fn name(&self) -> &'static str {
        "command"
    }

    fn analyze(&self, image_path: &Path) -> Result<Vec<FaceEmotion>> {
        let mut child = Command::new(&self.program)
            .args(&self.args)
            .arg(image_path)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .with_context(|| format!("run classifier {}", self.program))?;
        let stdout = drain::<ChildStdout>(child.stdout.take());
        let stderr = drain::<ChildStderr>(child.stderr.take());

        let status = self.wait_or_kill(&mut child)?;
        let stdout = collect(stdout);
        if !status.success() {
            let stderr = collect(stderr);
            return Err(anyhow!(
                "classifier {} exited with {}: {}",
                self.program,
                status,
                String::from_utf8_lossy(&stderr).trim()
            ));
        }
        let parsed: CommandOutput = serde_json::from_slice(&stdout)
            .with_context(|| format!("parse output of classifier {}", self.program))?;
        Ok(match parsed {
            CommandOutput::Faces(faces) => faces,
            CommandOutput::Face(face) => vec![face],
        })
    }
}
