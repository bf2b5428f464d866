//! 应用配置：从 config/default.toml 与环境变量加载
//!
//! 加载顺序：先读 TOML 文件，再用环境变量 `PAROLE__*` 覆盖（双下划线表示嵌套，如 `PAROLE__LLM__PROVIDER=openai`）。

use std::path::PathBuf;

use serde::Deserialize;

/// 应用配置根（对应 config/default.toml 的顶层）
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct AppConfig {
    #[serde(default)]
    pub app: AppSection,
    #[serde(default)]
    pub server: ServerSection,
    #[serde(default)]
    pub llm: LlmSection,
    #[serde(default)]
    pub live: LiveSection,
    #[serde(default)]
    pub pipeline: PipelineSection,
}

/// [app] 段：应用名与数据库
#[derive(Debug, Clone, Deserialize)]
pub struct AppSection {
    pub name: Option<String>,
    /// sqlx 连接串，如 sqlite://parole.db?mode=rwc
    #[serde(default = "default_database_url")]
    pub database_url: String,
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
}

impl Default for AppSection {
    fn default() -> Self {
        Self {
            name: None,
            database_url: default_database_url(),
            max_connections: default_max_connections(),
        }
    }
}

fn default_database_url() -> String {
    "sqlite://parole.db?mode=rwc".to_string()
}

fn default_max_connections() -> u32 {
    5
}

/// [server] 段：HTTP 与实时网关监听地址
#[derive(Debug, Clone, Deserialize)]
pub struct ServerSection {
    #[serde(default = "default_http_addr")]
    pub http_addr: String,
    #[serde(default = "default_live_addr")]
    pub live_addr: String,
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            http_addr: default_http_addr(),
            live_addr: default_live_addr(),
        }
    }
}

fn default_http_addr() -> String {
    "127.0.0.1:8080".to_string()
}

fn default_live_addr() -> String {
    "127.0.0.1:9000".to_string()
}

/// [llm] 段：后端选择与超时
#[derive(Debug, Clone, Deserialize)]
pub struct LlmSection {
    /// 后端：openai / deepseek / mock
    #[serde(default = "default_provider")]
    pub provider: String,
    #[serde(default = "default_model")]
    pub model: String,
    pub base_url: Option<String>,
    /// 缺省时使用端点默认值
    pub temperature: Option<f32>,
    #[serde(default)]
    pub timeouts: LlmTimeoutsSection,
}

impl Default for LlmSection {
    fn default() -> Self {
        Self {
            provider: default_provider(),
            model: default_model(),
            base_url: None,
            temperature: None,
            timeouts: LlmTimeoutsSection::default(),
        }
    }
}

fn default_provider() -> String {
    "openai".to_string()
}

fn default_model() -> String {
    "gpt-4o-mini".to_string()
}

#[derive(Debug, Clone, Deserialize)]
pub struct LlmTimeoutsSection {
    /// 单次请求超时（秒），交由传输层执行
    #[serde(default = "default_request_timeout")]
    pub request: u64,
}

impl Default for LlmTimeoutsSection {
    fn default() -> Self {
        Self {
            request: default_request_timeout(),
        }
    }
}

fn default_request_timeout() -> u64 {
    60
}

/// [live] 段：实时对练轮数阈值与回复线程池
#[derive(Debug, Clone, Deserialize)]
pub struct LiveSection {
    /// 达到该轮数后发送软提示
    #[serde(default = "default_notice_turn")]
    pub notice_turn: i64,
    /// 达到该轮数后强烈建议结束（服务端从不强制断开）
    #[serde(default = "default_warning_turn")]
    pub warning_turn: i64,
    #[serde(default = "default_min_finalize_turns")]
    pub min_finalize_turns: usize,
    /// force=true 时的最少轮数
    #[serde(default = "default_forced_min_turns")]
    pub forced_min_turns: usize,
    /// 同时进行的考官回复生成数
    #[serde(default = "default_reply_workers")]
    pub reply_workers: usize,
}

impl Default for LiveSection {
    fn default() -> Self {
        Self {
            notice_turn: default_notice_turn(),
            warning_turn: default_warning_turn(),
            min_finalize_turns: default_min_finalize_turns(),
            forced_min_turns: default_forced_min_turns(),
            reply_workers: default_reply_workers(),
        }
    }
}

fn default_notice_turn() -> i64 {
    12
}

fn default_warning_turn() -> i64 {
    15
}

fn default_min_finalize_turns() -> usize {
    12
}

fn default_forced_min_turns() -> usize {
    1
}

fn default_reply_workers() -> usize {
    4
}

/// [pipeline] 段：结构拆解质量门槛
#[derive(Debug, Clone, Deserialize)]
pub struct PipelineSection {
    /// 语块拼接后至少覆盖句子字符数的比例
    #[serde(default = "default_chunk_min_coverage")]
    pub chunk_min_coverage: f64,
}

impl Default for PipelineSection {
    fn default() -> Self {
        Self {
            chunk_min_coverage: default_chunk_min_coverage(),
        }
    }
}

fn default_chunk_min_coverage() -> f64 {
    0.4
}

/// 从 config 目录加载配置，环境变量 PAROLE__* 可覆盖
///
/// 1. 按顺序查找 config/default.toml、../config/default.toml、default.toml，找到则作为第一源
/// 2. 若传入 config_path 且文件存在，则追加该文件（可覆盖前面的键）
/// 3. 最后叠加环境变量 PAROLE__*（双下划线表示嵌套键）
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
        config::Environment::with_prefix("PAROLE")
            .separator("__")
            .try_parsing(true),
    );

    let c = builder.build()?;
    c.try_deserialize()
}
