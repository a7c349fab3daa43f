//! Startup strategies that decide which tools get registered.

use std::sync::Arc;

use async_trait::async_trait;

use super::{
    Browser, FetchUrl, FinalAnswer, ListDirectory, PythonExecute, ReadFile, RegistryError,
    RunCommand, SandboxExecute, Tool, ToolRegistry, WebSearch, WriteFile, FINAL_ANSWER_TOOL,
};
use crate::config::{BrowserConfig, Config, ToolsConfig};
use crate::sandbox::Sandbox;
use crate::util::command_on_path;

/// Every tool this crate ships, in registration order.
pub const BUILTIN_TOOL_NAMES: &[&str] = &[
    "read_file",
    "write_file",
    "list_directory",
    "fetch_url",
    "web_search",
    "python_execute",
    "run_command",
    "browser",
    "sandbox_execute",
    FINAL_ANSWER_TOOL,
];

/// What discovery may consult about the host.
#[derive(Clone)]
pub struct DiscoveryEnv {
    pub tools: ToolsConfig,
    pub browser: BrowserConfig,
    /// Present when `[sandbox].use_sandbox` is on.
    pub sandbox: Option<Sandbox>,
}

impl DiscoveryEnv {
    pub fn from_config(config: &Config, sandbox: Option<Sandbox>) -> Self {
        Self {
            tools: config.tools.clone(),
            browser: config.browser.clone(),
            sandbox,
        }
    }
}

/// Pluggable startup discovery. Library users may supply their own.
#[async_trait]
pub trait ToolDiscovery: Send + Sync {
    fn name(&self) -> &str;

    async fn discover(&self, env: &DiscoveryEnv) -> Result<Vec<Arc<dyn Tool>>, RegistryError>;
}

/// Pick the strategy `[tools]` asks for.
pub fn discovery_for(config: &ToolsConfig) -> Box<dyn ToolDiscovery> {
    if config.auto_discover {
        Box::new(CatalogDiscovery)
    } else {
        Box::new(StaticDiscovery::new(config.enabled.clone()))
    }
}

/// Discover tools the way `[tools]` asks and build the registry.
pub async fn discover_registry(
    config: &Config,
    sandbox: Option<Sandbox>,
) -> Result<ToolRegistry, RegistryError> {
    let env = DiscoveryEnv::from_config(config, sandbox);
    ToolRegistry::discover(discovery_for(&config.tools).as_ref(), &env).await
}

/// Construct a built-in. `None` means a hard prerequisite is missing.
fn build(name: &str, env: &DiscoveryEnv) -> Option<Arc<dyn Tool>> {
    let sandboxed = env.sandbox.is_some();
    let tool: Arc<dyn Tool> = match name {
        "read_file" => Arc::new(ReadFile),
        "write_file" => Arc::new(WriteFile),
        "list_directory" => Arc::new(ListDirectory),
        "fetch_url" => Arc::new(FetchUrl),
        "web_search" => Arc::new(WebSearch),
        "python_execute" if sandboxed => Arc::new(PythonExecute::sandboxed()),
        "python_execute" => Arc::new(PythonExecute::local("python3")),
        "run_command" if sandboxed => Arc::new(RunCommand::sandboxed()),
        "run_command" => Arc::new(RunCommand::local()),
        "browser" => {
            let binary = Browser::locate(&env.browser)?;
            Arc::new(Browser::new(binary, env.browser.clone()))
        }
        "sandbox_execute" if sandboxed => Arc::new(SandboxExecute),
        FINAL_ANSWER_TOOL => Arc::new(FinalAnswer),
        _ => return None,
    };
    Some(tool)
}

/// Exactly the configured list. A name that cannot be built is an error.
pub struct StaticDiscovery {
    enabled: Vec<String>,
}

impl StaticDiscovery {
    pub fn new(enabled: Vec<String>) -> Self {
        Self { enabled }
    }
}

#[async_trait]
impl ToolDiscovery for StaticDiscovery {
    fn name(&self) -> &str {
        "static"
    }

    async fn discover(&self, env: &DiscoveryEnv) -> Result<Vec<Arc<dyn Tool>>, RegistryError> {
        let mut tools = Vec::with_capacity(self.enabled.len() + 1);
        let mut seen = std::collections::HashSet::new();
        for name in &self.enabled {
            if !seen.insert(name.as_str()) {
                continue;
            }
            let tool = build(name, env).ok_or_else(|| RegistryError::Unknown(name.clone()))?;
            tools.push(tool);
        }
        if !seen.contains(FINAL_ANSWER_TOOL) {
            tools.push(Arc::new(FinalAnswer));
        }
        Ok(tools)
    }
}

/// Every built-in whose host prerequisites are met, optionally filtered by
/// the enabled list.
pub struct CatalogDiscovery;

impl CatalogDiscovery {
    async fn prerequisites_met(name: &str, env: &DiscoveryEnv) -> bool {
        match (name, &env.sandbox) {
            ("python_execute", None) => command_on_path("python3"),
            ("sandbox_execute", Some(sandbox)) => sandbox.available().await,
            _ => true,
        }
    }
}

#[async_trait]
impl ToolDiscovery for CatalogDiscovery {
    fn name(&self) -> &str {
        "catalog"
    }

    async fn discover(&self, env: &DiscoveryEnv) -> Result<Vec<Arc<dyn Tool>>, RegistryError> {
        let filter = &env.tools.enabled;
        let mut tools = Vec::new();
        for name in BUILTIN_TOOL_NAMES {
            let wanted = *name == FINAL_ANSWER_TOOL
                || filter.is_empty()
                || filter.iter().any(|n| n == name);
            if !wanted {
                continue;
            }
            if !Self::prerequisites_met(name, env).await {
                tracing::info!("Skipping tool {}: host prerequisites not met", name);
                continue;
            }
            match build(name, env) {
                Some(tool) => tools.push(tool),
                None => tracing::debug!("Tool {} not available on this host", name),
            }
        }
        for name in filter {
            if !BUILTIN_TOOL_NAMES.contains(&name.as_str()) {
                tracing::warn!("Ignoring unknown tool in [tools].enabled: {}", name);
            }
        }
        Ok(tools)
    }
}
