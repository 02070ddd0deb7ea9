//! Diagnostic pod and its `hint:` / `cmd:` / `result:` output protocol.

use super::naming::ActionNaming;
use super::poll::ActionContext;
use super::NodeActions;
use crate::error::{Error, Result};
use crate::observation::FaultObservation;
use crate::template::TemplateKind;
use crate::tickets::DiagnosisRecord;
use regex::Regex;
use std::sync::LazyLock;
use tracing::{info, instrument};

static DIAGNOSIS_LINE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^\s*(hint|cmd|result)\s*:\s?(.*?)\s*$").expect("diagnosis line pattern is valid")
});

/// Parses diagnose pod output into one record per `hint:` line.
///
/// `cmd:` and `result:` lines attach to the most recent hint. Lines before the first
/// hint and lines matching none of the keys are ignored; a trailing hint without
/// cmd/result still produces a record.
pub fn parse_diagnosis(logs: &str) -> Vec<DiagnosisRecord> {
    let mut records: Vec<DiagnosisRecord> = Vec::new();
    for line in logs.lines() {
        let Some(caps) = DIAGNOSIS_LINE.captures(line) else {
            continue;
        };
        let value = caps[2].to_string();
        match &caps[1] {
            "hint" => records.push(DiagnosisRecord {
                hint: value,
                cmd: None,
                result: None,
            }),
            "cmd" => {
                if let Some(current) = records.last_mut() {
                    current.cmd = Some(value);
                }
            }
            "result" => {
                if let Some(current) = records.last_mut() {
                    current.result = Some(value);
                }
            }
            _ => {}
        }
    }
    records
}

impl NodeActions<'_> {
    /// Runs a `diagnose-<node>` pod for the observation and parses its logs
    #[instrument(skip(self, ctx, status), fields(condition = %status.condition))]
    pub async fn diagnose(
        &self,
        ctx: &ActionContext,
        node: &str,
        status: &FaultObservation,
    ) -> Result<Vec<DiagnosisRecord>> {
        let scoped = ctx.with_timeout(self.bridge.config.timeouts.diagnose());
        let name = ActionNaming::name("diagnose", node);
        let mut params = self.bridge.base_params(node);
        params.insert("pod_name".to_string(), name.clone());
        params.insert("alert_name".to_string(), status.condition.clone());
        params.insert("type".to_string(), status.hardware_type.to_string());

        let outcome = self
            .run_pod(&scoped, TemplateKind::DiagnosePod, &name, &params)
            .await?;
        if !outcome.succeeded {
            return Err(Error::JobFailed {
                kind: "Pod".to_string(),
                name,
            });
        }

        let logs = self.cluster().pod_logs(self.namespace(), &name).await?;
        let records = parse_diagnosis(&logs);
        info!(node = %node, findings = records.len(), "🔍 Diagnosis collected");
        Ok(records)
    }
}
