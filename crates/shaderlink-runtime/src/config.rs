use std::time::Duration;

/// Timeouts and switches for the session and orchestration layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuntimeConfig {
    /// How long `open` waits for the connection plus `SessionReady`.
    pub session_establish_timeout: Duration,
    /// Per-call deadline for `compile_shader`.
    pub validation_timeout: Duration,
    /// Per-call deadline for every other remote tool.
    pub tool_timeout: Duration,
    /// Save, wrap in a material and preview accepted shaders.
    pub publish_artifacts: bool,
    /// Finished tasks kept for `snapshot`/`wait`; older ones are evicted.
    pub retained_tasks: usize,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            session_establish_timeout: Duration::from_secs(10),
            validation_timeout: Duration::from_secs(30),
            tool_timeout: Duration::from_secs(30),
            publish_artifacts: true,
            retained_tasks: 256,
        }
    }
}
