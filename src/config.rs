//! 应用配置：从 config/default.toml 与环境变量加载
//!
//! 加载顺序：先读 TOML 文件，再用环境变量 `EDITH__*` 覆盖（双下划线表示嵌套，如
//! `EDITH__LLM__MODEL=gpt-4o-mini`）。

use std::path::PathBuf;

use serde::Deserialize;

/// 应用配置根（对应 config/default.toml 的顶层）
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    #[serde(default)]
    pub app: AppSection,
    #[serde(default)]
    pub llm: LlmSection,
    #[serde(default)]
    pub memory: MemorySection,
    #[serde(default)]
    pub lifecycle: LifecycleSection,
}

/// [app] 段：应用名
#[derive(Debug, Clone, Deserialize, Default)]
pub struct AppSection {
    pub name: Option<String>,
}

/// [llm] 段：后端选择、模型与采样温度
#[derive(Debug, Clone, Deserialize)]
pub struct LlmSection {
    /// 后端：openai / mock；无 API Key 时自动退回 mock
    #[serde(default = "default_provider")]
    pub provider: String,
    #[serde(default = "default_model")]
    pub model: String,
    pub base_url: Option<String>,
    /// 对话生成温度
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    /// 路由分类温度（低温保证稳定）
    #[serde(default = "default_router_temperature")]
    pub router_temperature: f32,
}

fn default_provider() -> String {
    "openai".to_string()
}

fn default_model() -> String {
    "gpt-4o-mini".to_string()
}

fn default_temperature() -> f32 {
    0.7
}

fn default_router_temperature() -> f32 {
    0.1
}

// serde 的字段级 default 只在反序列化时生效，Default 必须走同一组函数
impl Default for LlmSection {
    fn default() -> Self {
        Self {
            provider: default_provider(),
            model: default_model(),
            base_url: None,
            temperature: default_temperature(),
            router_temperature: default_router_temperature(),
        }
    }
}

/// [memory] 段：上下文窗口的 token 预算
#[derive(Debug, Clone, Deserialize)]
pub struct MemorySection {
    /// 对话缓冲的最大估算 token 数，超出部分滚动摘要
    #[serde(default = "default_max_token_limit")]
    pub max_token_limit: usize,
}

fn default_max_token_limit() -> usize {
    2000
}

impl Default for MemorySection {
    fn default() -> Self {
        Self {
            max_token_limit: default_max_token_limit(),
        }
    }
}

/// [lifecycle] 段：后台消息处理
#[derive(Debug, Clone, Deserialize)]
pub struct LifecycleSection {
    /// 同时运行的后台生成任务上限
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent: usize,
    /// 未指定时的上下文消息条数
    #[serde(default = "default_context_limit")]
    pub context_limit: usize,
}

fn default_max_concurrent() -> usize {
    4
}

fn default_context_limit() -> usize {
    10
}

impl Default for LifecycleSection {
    fn default() -> Self {
        Self {
            max_concurrent: default_max_concurrent(),
            context_limit: default_context_limit(),
        }
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            app: AppSection::default(),
            llm: LlmSection::default(),
            memory: MemorySection::default(),
            lifecycle: LifecycleSection::default(),
        }
    }
}

/// 从 config 目录加载配置，环境变量 EDITH__* 可覆盖
///
/// 1. 按顺序查找 config/default.toml、../config/default.toml、default.toml，找到则作为第一源
/// 2. 若传入 config_path 且文件存在，则追加该文件（可覆盖前面的键）
/// 3. 最后叠加环境变量 EDITH__*（双下划线表示嵌套键）
pub fn load_config(config_path: Option<PathBuf>) -> Result<AppConfig, config::ConfigError> {
    let mut builder = config::Config::builder();

    let default_names = ["config/default", "../config/default", "default"];
    for name in default_names {
        let path = format!("{}.toml", name);
        if std::path::Path::new(&path).exists() {
            builder = builder.add_source(config::File::with_name(name).required(false));
            break;
        }
    }

    if let Some(ref path) = config_path {
        if path.exists() {
            builder = builder.add_source(config::File::from(path.clone()).required(false));
        }
    }

    builder = builder.add_source(
        config::Environment::with_prefix("EDITH")
            .separator("__")
            .try_parsing(true),
    );

    let c = builder.build()?;
    c.try_deserialize()
}
