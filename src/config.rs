use anyhow::{Context, Result};
use ::config::{Config, ConfigError, Environment, File as ConfigFile};
use serde::Deserialize;
use std::env;

use crate::index::Metric;

pub type Number = f32;

pub const EPSILON: f32 = 1e-6;

pub const DEFAULT_INDEX_DIR: &str = "ragdesk_index";
pub const DEFAULT_CORPUS_PATH: &str = "corpus.jsonl";
pub const DEFAULT_DIMENSIONS: usize = 384;
pub const DEFAULT_TOP_K: usize = 3;
pub const DEFAULT_OLLAMA_URL: &str = "http://localhost:11434";
pub const DEFAULT_OLLAMA_MODEL: &str = "all-minilm";
pub const MIN_KEEP_GENERATIONS: usize = 2;

#[derive(Deserialize, Default)]
pub struct RagdeskConfig {
    pub index_dir: Option<String>,
    pub corpus_path: Option<String>,
    pub dimensions: Option<usize>,
    pub top_k: Option<usize>,
    pub metric: Option<String>,
    pub embedder: Option<String>,
    pub ollama_url: Option<String>,
    pub ollama_model: Option<String>,
    pub keep_generations: Option<usize>,
    pub verbose: Option<bool>,
}

impl RagdeskConfig {
    pub fn try_from(config: &Config) -> Result<Self, ConfigError> {
        Ok(RagdeskConfig {
            index_dir: config.get("index_dir").ok(),
            corpus_path: config.get("corpus_path").ok(),
            dimensions: config.get("dimensions").ok(),
            top_k: config.get("top_k").ok(),
            metric: config.get("metric").ok(),
            embedder: config.get("embedder").ok(),
            ollama_url: config.get("ollama_url").ok(),
            ollama_model: config.get("ollama_model").ok(),
            keep_generations: config.get("keep_generations").ok(),
            verbose: config.get("verbose").ok(),
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EmbedderKind {
    Hashing,
    Ollama,
}

impl std::str::FromStr for EmbedderKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "hashing" => Ok(Self::Hashing),
            "ollama" => Ok(Self::Ollama),
            other => anyhow::bail!("Unknown embedder '{}' (expected 'hashing' or 'ollama')", other),
        }
    }
}

impl EmbedderKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Hashing => "hashing",
            Self::Ollama => "ollama",
        }
    }
}

#[derive(Debug, Clone)]
pub struct State {
    pub index_dir: String,
    pub corpus_path: String,
    pub dimensions: usize,
    pub top_k: usize,
    pub metric: Metric,
    pub embedder: EmbedderKind,
    pub ollama_url: String,
    pub ollama_model: String,
    pub keep_generations: usize,
    pub verbose: bool,
}

impl State {
    /// Reads `ragdesk_config.*` from the working directory, then `RAGDESK_*`
    /// environment variables, then falls back to defaults.
    pub fn new() -> Result<Self> {
        let mut config = Config::default();
        #[allow(deprecated)]
        {
            config.merge(ConfigFile::with_name("ragdesk_config").required(false))?;
            config.merge(Environment::with_prefix("RAGDESK"))?;
        }

        let ragdesk_config = RagdeskConfig::try_from(&config)?;
        Self::from_config(ragdesk_config)
    }

    pub fn from_config(ragdesk_config: RagdeskConfig) -> Result<Self> {
        let index_dir = ragdesk_config
            .index_dir
            .unwrap_or_else(|| DEFAULT_INDEX_DIR.to_string());

        let corpus_path = ragdesk_config
            .corpus_path
            .unwrap_or_else(|| DEFAULT_CORPUS_PATH.to_string());

        let dimensions = ragdesk_config.dimensions.unwrap_or(DEFAULT_DIMENSIONS);
        let top_k = ragdesk_config.top_k.unwrap_or(DEFAULT_TOP_K);

        let metric = match ragdesk_config.metric {
            Some(name) => name
                .parse::<Metric>()
                .with_context(|| format!("Invalid RAGDESK_METRIC '{}'", name))?,
            None => Metric::default(),
        };

        let embedder = match ragdesk_config.embedder {
            Some(name) => name.parse::<EmbedderKind>()?,
            None => EmbedderKind::Hashing,
        };

        let ollama_url = ragdesk_config
            .ollama_url
            .unwrap_or_else(|| DEFAULT_OLLAMA_URL.to_string());

        let ollama_model = ragdesk_config
            .ollama_model
            .unwrap_or_else(|| DEFAULT_OLLAMA_MODEL.to_string());

        let keep_generations = ragdesk_config
            .keep_generations
            .unwrap_or(MIN_KEEP_GENERATIONS)
            .max(MIN_KEEP_GENERATIONS);

        let verbose = ragdesk_config
            .verbose
            .or_else(|| env::var("RAGDESK_VERBOSE").ok().map(|v| v == "true"))
            .unwrap_or(false);

        if dimensions == 0 {
            anyhow::bail!("RAGDESK_DIMENSIONS must be greater than zero.");
        }
        if top_k == 0 {
            anyhow::bail!("RAGDESK_TOP_K must be greater than zero.");
        }

        Ok(Self {
            index_dir,
            corpus_path,
            dimensions,
            top_k,
            metric,
            embedder,
            ollama_url,
            ollama_model,
            keep_generations,
            verbose,
        })
    }

    pub fn print_config(&self) {
        println!("index_dir={}", self.index_dir);
        println!("corpus_path={}", self.corpus_path);
        println!("dimensions={}", self.dimensions);
        println!("top_k={}", self.top_k);
        println!("metric={}", self.metric.as_str());
        println!("embedder={}", self.embedder.as_str());
        println!("ollama_url={}", self.ollama_url);
        println!("ollama_model={}", self.ollama_model);
        println!("keep_generations={}", self.keep_generations);
        println!("verbose={}", self.verbose);
    }
}
