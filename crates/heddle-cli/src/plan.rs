//! Plan file - TOML で書いたタスクの一括登録
//!
//! ```toml
//! project = "nightly"
//!
//! [[tasks]]
//! key = "fetch"
//! type = "echo"
//! priority = 7
//! payload = { action = "fetch", parameters = { url = "https://example.com" } }
//!
//! [[tasks]]
//! key = "index"
//! type = "echo"
//! after = ["fetch"]
//! ```

use std::collections::HashMap;
use std::path::Path;

use anyhow::{Context as _, Result, bail};
use heddle_core::domain::NewTask;
use serde::Deserialize;
use serde_json::{Value, json};

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PlanFile {
    pub project: Option<String>,
    #[serde(default)]
    pub tasks: Vec<PlanTask>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PlanTask {
    pub key: String,
    #[serde(rename = "type")]
    pub task_type: String,
    pub priority: Option<i32>,
    #[serde(default)]
    pub after: Vec<String>,
    pub payload: Option<Value>,
}

impl PlanFile {
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read plan {}", path.display()))?;
        Self::parse(&text).with_context(|| format!("invalid plan {}", path.display()))
    }

    pub fn parse(text: &str) -> Result<Self> {
        let plan: Self = toml::from_str(text)?;
        if plan.tasks.is_empty() {
            bail!("plan has no [[tasks]]");
        }
        Ok(plan)
    }

    /// Registration batch, `after` keys turned into batch positions.
    pub fn to_batch(&self) -> Result<Vec<NewTask>> {
        let mut index = HashMap::with_capacity(self.tasks.len());
        for (i, task) in self.tasks.iter().enumerate() {
            if index.insert(task.key.as_str(), i).is_some() {
                bail!("duplicate task key {:?}", task.key);
            }
        }

        self.tasks
            .iter()
            .map(|task| {
                let mut new = NewTask::new(task.task_type.as_str())
                    .named(task.key.as_str())
                    .payload(
                        task.payload
                            .clone()
                            .unwrap_or_else(|| json!({"action": task.key})),
                    );
                if let Some(priority) = task.priority {
                    new = new.priority(priority);
                }
                for key in &task.after {
                    let Some(&position) = index.get(key.as_str()) else {
                        bail!("task {:?} runs after unknown task {:?}", task.key, key);
                    };
                    new = new.after_batch(position);
                }
                Ok(new)
            })
            .collect()
    }

    /// Distinct task types, in first-use order.
    pub fn task_types(&self) -> Vec<&str> {
        let mut types: Vec<&str> = Vec::new();
        for task in &self.tasks {
            if !types.contains(&task.task_type.as_str()) {
                types.push(&task.task_type);
            }
        }
        types
    }
}
