// ABOUTME: Image build driver over the Docker build-event stream
// ABOUTME: Frames build output live, filters step noise, extracts the built image id

use std::collections::HashMap;

use bollard::image::BuildImageOptions;
use bollard::models::BuildInfo;
use bollard::Docker;
use futures::StreamExt;
use lazy_static::lazy_static;
use regex::Regex;
use tokio::io::AsyncWrite;
use tracing::debug;

use crate::blockquote::BlockquoteWriter;
use crate::error::{Result, SandboxError};

lazy_static! {
    static ref STEP_HEADER: Regex = Regex::new(r"^Step \d+/\d+ : ").unwrap();
}

/// A build recipe plus the files it references, as an in-memory tar archive.
#[derive(Debug, Clone)]
pub struct BuildContext {
    archive: Vec<u8>,
}

impl BuildContext {
    pub fn from_dockerfile(dockerfile: &str) -> Result<Self> {
        Self::with_files(dockerfile, &[])
    }

    pub fn with_files(dockerfile: &str, files: &[(&str, &[u8])]) -> Result<Self> {
        let mut builder = tar::Builder::new(Vec::new());
        append_entry(&mut builder, "Dockerfile", dockerfile.as_bytes())?;
        for (name, data) in files {
            append_entry(&mut builder, name, data)?;
        }
        Ok(Self {
            archive: builder.into_inner()?,
        })
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.archive
    }
}

fn append_entry(builder: &mut tar::Builder<Vec<u8>>, name: &str, data: &[u8]) -> Result<()> {
    let mut header = tar::Header::new_gnu();
    header.set_size(data.len() as u64);
    header.set_mode(0o644);
    header.set_cksum();
    builder.append_data(&mut header, name, data)?;
    Ok(())
}

#[derive(Debug, Clone)]
pub struct ImageBuildRequest {
    pub context: BuildContext,
    /// Ordered name/value pairs passed to the recipe's `ARG`s.
    pub build_args: Vec<(String, String)>,
    pub tag: Option<String>,
}

/// What one engine build event means to us.
#[derive(Debug, Clone, PartialEq, Eq)]
enum BuildEvent {
    /// Log lines worth echoing, already stripped of step noise.
    Output(Vec<String>),
    /// The engine announced the id of the image it produced.
    ImageId(String),
    /// The engine embedded an error in the stream; the build is dead.
    Failure(String),
    /// Progress chatter with nothing for us in it.
    Quiet,
}

fn classify(info: &BuildInfo) -> BuildEvent {
    if let Some(detail) = &info.error_detail {
        return BuildEvent::Failure(detail.message.clone().unwrap_or_default());
    }
    if let Some(error) = &info.error {
        return BuildEvent::Failure(error.clone());
    }
    if let Some(aux) = &info.aux {
        if let Some(id) = &aux.id {
            return BuildEvent::ImageId(id.clone());
        }
    }
    if let Some(stream) = &info.stream {
        let lines: Vec<String> = stream
            .lines()
            .filter(|line| !is_step_noise(line) && !line.trim().is_empty())
            .map(str::to_owned)
            .collect();
        return BuildEvent::Output(lines);
    }
    BuildEvent::Quiet
}

/// Layer pointers and step headers are classic-builder bookkeeping, not build
/// output.
fn is_step_noise(line: &str) -> bool {
    line.starts_with(" ---> ") || STEP_HEADER.is_match(line)
}

/// Drives the engine's image-build call and consumes its event stream in
/// emission order.
pub struct ImageBuilder {
    client: Docker,
}

impl ImageBuilder {
    pub fn new() -> Result<Self> {
        Ok(Self {
            client: Docker::connect_with_defaults()?,
        })
    }

    pub fn with_client(client: Docker) -> Self {
        Self { client }
    }

    /// Build an image, echoing filtered build output through `sink` as it
    /// arrives, and return the id of the resulting image.
    ///
    /// Any error event aborts immediately; output already flushed stays on
    /// the terminal. A stream that ends without announcing an image id is a
    /// build failure too.
    pub async fn build<W>(&self, request: ImageBuildRequest, sink: W) -> Result<String>
    where
        W: AsyncWrite + Unpin,
    {
        let options = BuildImageOptions {
            dockerfile: "Dockerfile".to_string(),
            t: request.tag.clone().unwrap_or_default(),
            rm: true,
            buildargs: request
                .build_args
                .iter()
                .cloned()
                .collect::<HashMap<String, String>>(),
            ..Default::default()
        };
        let context = bytes::Bytes::from(request.context.into_bytes());
        let mut events = self
            .client
            .build_image(options, None, Some(bollard::body_full(context)));

        let mut quoted = BlockquoteWriter::new(sink);
        quoted.open().await?;
        let mut image_id = None;

        while let Some(event) = events.next().await {
            let info = match event {
                Ok(info) => info,
                Err(e) => {
                    quoted.close().await?;
                    return Err(e.into());
                }
            };
            match classify(&info) {
                BuildEvent::Output(lines) => {
                    for line in lines {
                        quoted.write_chunk(format!("{line}\n").as_bytes()).await?;
                    }
                }
                BuildEvent::ImageId(id) => {
                    debug!("built image {id}");
                    image_id = Some(id);
                }
                BuildEvent::Failure(message) => {
                    quoted.close().await?;
                    return Err(SandboxError::Build(message));
                }
                BuildEvent::Quiet => {}
            }
        }

        quoted.close().await?;
        image_id.ok_or_else(|| SandboxError::Build("no image produced".to_string()))
    }
}
