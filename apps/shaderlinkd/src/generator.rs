use std::path::PathBuf;

use async_trait::async_trait;
use shaderlink_protocol::{
    GeneratedShader, GenerationRequest, LinkError, LinkResult, ShaderGenerator,
};
use tracing::{info, warn};

/// Serves shader source from a file on disk. The file is re-read on every
/// attempt, so it can be fixed by hand between repair rounds.
#[derive(Debug, Clone)]
pub struct FileGenerator {
    path: PathBuf,
}

impl FileGenerator {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait]
impl ShaderGenerator for FileGenerator {
    async fn generate(&self, request: GenerationRequest) -> LinkResult<GeneratedShader> {
        for diagnostic in &request.diagnostics {
            warn!(attempt = request.attempt, %diagnostic, "previous attempt");
        }
        let code = tokio::fs::read_to_string(&self.path).await.map_err(|error| {
            LinkError::Generator(format!("failed reading {}: {error}", self.path.display()))
        })?;
        if code.trim().is_empty() {
            return Err(LinkError::Generator(format!(
                "{} is empty",
                self.path.display()
            )));
        }
        info!(
            attempt = request.attempt,
            path = %self.path.display(),
            bytes = code.len(),
            "loaded shader source"
        );
        Ok(GeneratedShader::new(code))
    }
}
