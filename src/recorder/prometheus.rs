use std::collections::HashMap;
use std::sync::Mutex;

use super::{RecorderError, UsageRecorder};

const OVERFLOW_LABEL: &str = "__overflow__";

#[derive(Clone, Debug)]
pub struct PrometheusRecorderConfig {
    pub max_model_series: usize,
    pub max_backend_series: usize,
}

impl Default for PrometheusRecorderConfig {
    fn default() -> Self {
        Self {
            max_model_series: 1024,
            max_backend_series: 128,
        }
    }
}

#[derive(Debug, Default)]
struct Counters {
    requests_total: u64,
    requests_by_model: HashMap<String, u64>,
    backend_attempts: HashMap<String, u64>,
    input_tokens_total: u64,
    output_tokens_total: u64,
    completions_by_success: HashMap<String, u64>,
}

/// Process-wide usage counters rendered in the Prometheus text format.
#[derive(Debug, Default)]
pub struct PrometheusRecorder {
    config: PrometheusRecorderConfig,
    counters: Mutex<Counters>,
}

impl PrometheusRecorder {
    pub fn new(config: PrometheusRecorderConfig) -> Self {
        Self {
            config,
            counters: Mutex::new(Counters::default()),
        }
    }

    fn update(
        &self,
        f: impl FnOnce(&mut Counters, &PrometheusRecorderConfig),
    ) -> Result<(), RecorderError> {
        let mut counters = self.counters.lock().map_err(|_| RecorderError::Poisoned)?;
        f(&mut *counters, &self.config);
        Ok(())
    }

    pub fn render(&self) -> String {
        let Ok(counters) = self.counters.lock() else {
            return String::new();
        };
        let mut out = String::new();

        out.push_str("# HELP aigw_requests_total Total requests started.\n");
        out.push_str("# TYPE aigw_requests_total counter\n");
        out.push_str(&format!("aigw_requests_total {}\n", counters.requests_total));

        write_counter_map(
            &mut out,
            "aigw_requests_by_model_total",
            "Requests grouped by model.",
            "model",
            &counters.requests_by_model,
        );
        write_counter_map(
            &mut out,
            "aigw_backend_attempts_total",
            "Backend attempts grouped by backend.",
            "backend",
            &counters.backend_attempts,
        );

        out.push_str("# HELP aigw_input_tokens_total Total input tokens.\n");
        out.push_str("# TYPE aigw_input_tokens_total counter\n");
        out.push_str(&format!(
            "aigw_input_tokens_total {}\n",
            counters.input_tokens_total
        ));
        out.push_str("# HELP aigw_output_tokens_total Total output tokens.\n");
        out.push_str("# TYPE aigw_output_tokens_total counter\n");
        out.push_str(&format!(
            "aigw_output_tokens_total {}\n",
            counters.output_tokens_total
        ));

        write_counter_map(
            &mut out,
            "aigw_request_completions_total",
            "Completed requests grouped by outcome.",
            "success",
            &counters.completions_by_success,
        );
        out
    }
}

impl UsageRecorder for PrometheusRecorder {
    fn name(&self) -> &str {
        "prometheus"
    }

    fn start_request(&self) -> Result<(), RecorderError> {
        self.update(|counters, _| {
            counters.requests_total = counters.requests_total.saturating_add(1);
        })
    }

    fn set_model(&self, model: &str) -> Result<(), RecorderError> {
        self.update(|counters, config| {
            bump_limited(&mut counters.requests_by_model, model, config.max_model_series);
        })
    }

    fn set_backend(&self, backend: &str) -> Result<(), RecorderError> {
        self.update(|counters, config| {
            bump_limited(
                &mut counters.backend_attempts,
                backend,
                config.max_backend_series,
            );
        })
    }

    fn record_token_usage(
        &self,
        input_tokens: u32,
        output_tokens: u32,
        _total_tokens: u32,
    ) -> Result<(), RecorderError> {
        self.update(|counters, _| {
            counters.input_tokens_total = counters
                .input_tokens_total
                .saturating_add(u64::from(input_tokens));
            counters.output_tokens_total = counters
                .output_tokens_total
                .saturating_add(u64::from(output_tokens));
        })
    }

    fn record_request_completion(&self, success: bool) -> Result<(), RecorderError> {
        self.update(|counters, _| {
            *counters
                .completions_by_success
                .entry(success.to_string())
                .or_default() += 1;
        })
    }
}

fn bump_limited(map: &mut HashMap<String, u64>, key: &str, max_series: usize) {
    let key = if map.contains_key(key) || map.len() < max_series {
        key.to_string()
    } else {
        OVERFLOW_LABEL.to_string()
    };
    *map.entry(key).or_default() += 1;
}

fn write_counter_map(
    out: &mut String,
    metric: &str,
    help: &str,
    label: &str,
    map: &HashMap<String, u64>,
) {
    out.push_str(&format!("# HELP {metric} {help}\n"));
    out.push_str(&format!("# TYPE {metric} counter\n"));

    let mut entries: Vec<(&String, &u64)> = map.iter().collect();
    entries.sort_by(|(a, _), (b, _)| a.cmp(b));
    for (value, count) in entries {
        out.push_str(&format!(
            "{metric}{{{label}=\"{}\"}} {count}\n",
            escape_label_value(value)
        ));
    }
}

fn escape_label_value(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for c in value.chars() {
        match c {
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '"' => out.push_str("\\\""),
            _ => out.push(c),
        }
    }
    out
}
