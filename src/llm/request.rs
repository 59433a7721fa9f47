//! 单阶段请求 / 结果与内容寻址缓存键

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::core::Context;
use crate::stages::StageKind;

/// 生成参数（同时参与缓存键计算）
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GenerationParams {
    pub temperature: f32,
    pub top_p: f32,
    pub max_tokens: Option<u32>,
}

impl Default for GenerationParams {
    fn default() -> Self {
        Self {
            temperature: 0.7,
            top_p: 1.0,
            max_tokens: None,
        }
    }
}

/// 发往远端模型的一次请求；每次运行每阶段新建，构造后不再修改
#[derive(Debug, Clone)]
pub struct StageRequest {
    stage: StageKind,
    model: String,
    system_prompt: String,
    prompt: String,
    context: Context,
    image: Option<String>,
    params: GenerationParams,
}

impl StageRequest {
    pub fn new(stage: StageKind, model: impl Into<String>, prompt: impl Into<String>) -> Self {
        Self {
            stage,
            model: model.into(),
            system_prompt: String::new(),
            prompt: prompt.into(),
            context: Context::default(),
            image: None,
            params: GenerationParams::default(),
        }
    }

    pub fn with_system_prompt(mut self, system: impl Into<String>) -> Self {
        self.system_prompt = system.into();
        self
    }

    pub fn with_context(mut self, context: Context) -> Self {
        self.context = context;
        self
    }

    pub fn with_image(mut self, image: Option<&str>) -> Self {
        self.image = image.map(String::from);
        self
    }

    pub fn with_params(mut self, params: GenerationParams) -> Self {
        self.params = params;
        self
    }

    pub fn stage(&self) -> StageKind {
        self.stage
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    pub fn system_prompt(&self) -> &str {
        &self.system_prompt
    }

    pub fn prompt(&self) -> &str {
        &self.prompt
    }

    pub fn context(&self) -> &Context {
        &self.context
    }

    pub fn image(&self) -> Option<&str> {
        self.image.as_deref()
    }

    pub fn params(&self) -> &GenerationParams {
        &self.params
    }

    pub fn cache_key(&self) -> CacheKey {
        CacheKey::of(self)
    }
}

/// 远端调用成功后的结果；latency 为整段飞行时长（含重试与退避）
#[derive(Debug, Clone, PartialEq)]
pub struct StageResult {
    pub text: String,
    pub stage: StageKind,
    pub model: String,
    pub latency: Duration,
    pub attempts: u32,
    pub cache_hit: bool,
}

/// SHA-256(model, system, prompt, context, image, params)
///
/// 每个字段带长度前缀写入，避免拼接歧义；阶段本身不参与（相同输入跨阶段可复用）。
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct CacheKey([u8; 32]);

impl CacheKey {
    pub fn of(request: &StageRequest) -> Self {
        let mut hasher = Sha256::new();
        feed(&mut hasher, &request.model);
        feed(&mut hasher, &request.system_prompt);
        feed(&mut hasher, &request.prompt);
        hasher.update((request.context.len() as u64).to_le_bytes());
        for (k, v) in request.context.iter() {
            feed(&mut hasher, k);
            feed(&mut hasher, v);
        }
        match &request.image {
            Some(image) => {
                hasher.update([1u8]);
                feed(&mut hasher, image);
            }
            None => hasher.update([0u8]),
        }
        hasher.update(request.params.temperature.to_bits().to_le_bytes());
        hasher.update(request.params.top_p.to_bits().to_le_bytes());
        hasher.update(request.params.max_tokens.unwrap_or(0).to_le_bytes());
        hasher.update([request.params.max_tokens.is_some() as u8]);
        Self(hasher.finalize().into())
    }

    /// 分片下标（缓存按摘要首字节分片）
    pub(crate) fn shard(&self, shards: usize) -> usize {
        self.0[0] as usize % shards
    }
}

fn feed(hasher: &mut Sha256, s: &str) {
    hasher.update((s.len() as u64).to_le_bytes());
    hasher.update(s.as_bytes());
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

impl fmt::Debug for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "CacheKey({})", &hex::encode(self.0)[..16])
    }
}
