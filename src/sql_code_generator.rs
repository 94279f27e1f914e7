use anyhow::Error;
use candle_core::{DType, Device, Tensor};
use candle_examples::token_output_stream::TokenOutputStream;
use candle_nn::VarBuilder;
use candle_transformers::{
    generation::LogitsProcessor,
    models::qwen2::{Config, ModelForCausalLM},
};
use chat_templates::{apply_template, ChatTemplate, Message};
use hf_hub::{api::sync::ApiBuilder, Repo, RepoType};
use tokenizers::Tokenizer;

use crate::bridge::SqlGenerator;
use crate::config::{DevicePreference, GeneratorConfig};

const STOP_TOKENS: [&str; 2] = ["<|endoftext|>", "<|im_end|>"];

const SYSTEM_PROMPT: &str = r#"You translate questions into DuckDB SQL. Reply with a single valid DuckDB SQL query and nothing else.

DuckDB dialect notes:
- Identifiers with spaces, special characters or significant case go in double quotes; string literals use single quotes.
- Files can be queried in place: `SELECT * FROM 'events.parquet';` works for CSV, Parquet and JSON.
- A query may start with FROM: `FROM orders WHERE total > 10;` means `SELECT * FROM orders WHERE total > 10;`.
- `CREATE TABLE new_table AS SELECT ...` is supported.
- Attached databases are addressed as `db.table`; `USE db;` changes the default.
- Casts use `::`, e.g. `'42'::INTEGER`; implicit casts are lenient.
- Strings and lists slice with `[start:end]`, 1-based: `'DuckDB'[1:4]`.
- `COLUMNS('regex')` selects or transforms every matching column; `SELECT * EXCLUDE (col)` and `SELECT * REPLACE (expr AS col)` edit star expansions.
- `GROUP BY ALL` and `ORDER BY ALL` group or order by every non-aggregated column.
- `UNION BY NAME` aligns columns by name rather than position.
- Literals: lists `[1, 2]`, structs `{'a': 1}`, maps `MAP([1, 2], ['x', 'y'])`; fixed-size arrays are typed `INTEGER[3]`.
- Struct fields are read with `.` or `['field']`; map values with `[key]`.
- Dates: `strftime(NOW(), '%Y-%m-%d')`, `strptime('2023-07-23', '%Y-%m-%d')`, `EXTRACT(YEAR FROM d)`.
- Aliases from the SELECT list may be used in WHERE, GROUP BY and HAVING.
- List comprehensions: `[x * 2 FOR x IN [1, 2, 3]]`.
- Function chaining: `'DuckDB'.replace('Duck', 'Goose').upper()`.
- JSON paths: `data->'$.user.id'` returns JSON, `data->>'$.event'` returns text.
- Regex: `regexp_matches`, `regexp_replace`, `regexp_extract`.
- Sampling: `SELECT * FROM big_table USING SAMPLE 10%;`
"#;

/// Local Qwen2 text-to-SQL model run with candle.
pub struct SqlCodeGenerator {
    model: ModelForCausalLM,
    device: Device,
    tokenizer: TokenOutputStream,
    logits_processor: LogitsProcessor,
    stop_tokens: Vec<u32>,
    repeat_penalty: f32,
    repeat_last_n: usize,
    max_new_tokens: usize,
}

fn select_device(preference: DevicePreference) -> Result<Device, Error> {
    match preference {
        DevicePreference::Cpu => Ok(Device::Cpu),
        DevicePreference::Metal => Ok(Device::new_metal(0)?),
        DevicePreference::Auto => {
            #[cfg(target_os = "macos")]
            return Ok(Device::new_metal(0)?);
            #[cfg(not(target_os = "macos"))]
            return Ok(Device::Cpu);
        }
    }
}

/// Messages fed to the ChatML template for one request.
pub fn chat_messages(prompt: &str, table_schema: &str) -> Vec<Message> {
    vec![
        Message {
            role: "system".to_string(),
            content: SYSTEM_PROMPT.to_string(),
        },
        Message {
            role: "user".to_string(),
            content: format!("{}\nSCHEMA: {}", prompt, table_schema),
        },
    ]
}

impl SqlCodeGenerator {
    /// Downloads (or reuses cached) model files and loads the weights.
    pub fn new(config: &GeneratorConfig) -> Result<Self, Error> {
        let mut api = ApiBuilder::new().with_progress(false);
        if let Some(dir) = &config.cache_dir {
            api = api.with_cache_dir(dir.clone());
        }
        let api = api.build()?;
        let repo = api.repo(Repo::with_revision(
            config.model_id.clone(),
            RepoType::Model,
            config.revision.clone(),
        ));
        tracing::info!(model = %config.model_id, revision = %config.revision, "resolving model files");

        let tokenizer_filename = repo.get("tokenizer.json")?;
        let weights = vec![repo.get(&config.weights_file)?];
        let config_file = repo.get("config.json")?;

        let tokenizer = Tokenizer::from_file(tokenizer_filename).map_err(Error::msg)?;
        let stop_tokens = STOP_TOKENS
            .iter()
            .map(|name| {
                tokenizer
                    .token_to_id(name)
                    .ok_or_else(|| anyhow::anyhow!("cannot find the {name} token"))
            })
            .collect::<Result<Vec<_>, _>>()?;

        let device = select_device(config.device)?;
        let model_config: Config = serde_json::from_slice(&std::fs::read(config_file)?)?;
        // SAFETY: the safetensors files live in the hf-hub cache and are not
        // modified while mapped.
        let vb = unsafe { VarBuilder::from_mmaped_safetensors(&weights, DType::F32, &device)? };
        let model = ModelForCausalLM::new(&model_config, vb)?;
        tracing::info!(device = ?device, "model loaded");

        let temperature = (config.temperature > 0.0).then_some(config.temperature);
        Ok(Self {
            model,
            device,
            tokenizer: TokenOutputStream::new(tokenizer),
            logits_processor: LogitsProcessor::new(config.seed, temperature, None),
            stop_tokens,
            repeat_penalty: config.repeat_penalty,
            repeat_last_n: config.repeat_last_n,
            max_new_tokens: config.max_new_tokens,
        })
    }

    fn prompt_tokens(&self, prompt: &str, table_schema: &str) -> Result<Vec<u32>, Error> {
        let chat = apply_template(ChatTemplate::ChatML, &chat_messages(prompt, table_schema), true)?;
        Ok(self
            .tokenizer
            .tokenizer()
            .encode(chat, true)
            .map_err(Error::msg)?
            .get_ids()
            .to_vec())
    }

    fn next_token(&mut self, tokens: &[u32], index: usize) -> Result<u32, Error> {
        let context_size = if index > 0 { 1 } else { tokens.len() };
        let start_pos = tokens.len().saturating_sub(context_size);
        let input = Tensor::new(&tokens[start_pos..], &self.device)?.unsqueeze(0)?;
        let logits = self.model.forward(&input, start_pos)?;
        let logits = logits.squeeze(0)?.squeeze(0)?.to_dtype(DType::F32)?;
        let logits = if self.repeat_penalty == 1. {
            logits
        } else {
            let start_at = tokens.len().saturating_sub(self.repeat_last_n);
            candle_transformers::utils::apply_repeat_penalty(
                &logits,
                self.repeat_penalty,
                &tokens[start_at..],
            )?
        };
        Ok(self.logits_processor.sample(&logits)?)
    }
}

impl SqlGenerator for SqlCodeGenerator {
    #[tracing::instrument(skip_all)]
    fn generate(&mut self, prompt: &str, table_schema: &str) -> Result<String, Error> {
        self.tokenizer.clear();
        self.model.clear_kv_cache();

        let mut tokens = self.prompt_tokens(prompt, table_schema)?;
        let prompt_len = tokens.len();
        let mut output = String::new();

        for index in 0..self.max_new_tokens {
            let next_token = self.next_token(&tokens, index)?;
            tokens.push(next_token);
            if self.stop_tokens.contains(&next_token) {
                break;
            }
            if let Some(t) = self.tokenizer.next_token(next_token)? {
                output.push_str(&t);
            }
        }
        if let Some(rest) = self.tokenizer.decode_rest().map_err(Error::msg)? {
            output.push_str(&rest);
        }
        self.model.clear_kv_cache();

        tracing::debug!(
            prompt_tokens = prompt_len,
            generated_tokens = tokens.len() - prompt_len,
            "decoding finished"
        );
        Ok(output)
    }
}
