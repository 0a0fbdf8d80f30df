//! Pipeline definition – the fixed, ordered stages every task passes through.

/// Well-known registry names of the standard stage workers.
pub const DEVELOPER_AGENT: &str = "developer-agent";
pub const TESTER_AGENT: &str = "tester-agent";
pub const QA_AGENT: &str = "qa-agent";
pub const DEPLOYMENT_AGENT: &str = "deployment-agent";

/// The permission a privileged stage must obtain from the gate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Privilege {
    pub action: String,
    pub resource: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PipelineStage {
    /// Stage label, e.g. `"implement"`.
    pub name: String,
    /// Registry name of the service that performs the stage.
    pub service: String,
    /// Set for stages that must pass the permission gate first.
    pub privilege: Option<Privilege>,
}

impl PipelineStage {
    pub fn new(name: impl Into<String>, service: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            service: service.into(),
            privilege: None,
        }
    }

    /// Mark the stage privileged: it needs `action` on `resource`.
    pub fn privileged(mut self, action: impl Into<String>, resource: impl Into<String>) -> Self {
        self.privilege = Some(Privilege {
            action: action.into(),
            resource: resource.into(),
        });
        self
    }

    pub fn is_privileged(&self) -> bool {
        self.privilege.is_some()
    }
}

/// An ordered list of [`PipelineStage`]s.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Pipeline {
    stages: Vec<PipelineStage>,
}

impl Pipeline {
    pub fn new(stages: Vec<PipelineStage>) -> Self {
        Self { stages }
    }

    /// implement → verify → review → finalize, where finalize deploys to
    /// production and therefore needs `DEPLOY` on `prod`.
    pub fn standard() -> Self {
        Self::new(vec![
            PipelineStage::new("implement", DEVELOPER_AGENT),
            PipelineStage::new("verify", TESTER_AGENT),
            PipelineStage::new("review", QA_AGENT),
            PipelineStage::new("finalize", DEPLOYMENT_AGENT).privileged("DEPLOY", "prod"),
        ])
    }

    pub fn stages(&self) -> &[PipelineStage] {
        &self.stages
    }

    pub fn len(&self) -> usize {
        self.stages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }
}

impl Default for Pipeline {
    fn default() -> Self {
        Self::standard()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn standard_pipeline_order() {
        let pipeline = Pipeline::standard();
        let names: Vec<&str> = pipeline.stages().iter().map(|s| s.name.as_str()).collect();
        assert_eq!(names, ["implement", "verify", "review", "finalize"]);
    }

    #[test]
    fn only_finalize_is_privileged() {
        let pipeline = Pipeline::standard();
        let privileged: Vec<&PipelineStage> = pipeline.stages().iter().filter(|s| s.is_privileged()).collect();
        assert_eq!(privileged.len(), 1);
        assert_eq!(privileged[0].service, DEPLOYMENT_AGENT);
        assert_eq!(
            privileged[0].privilege,
            Some(Privilege {
                action: "DEPLOY".into(),
                resource: "prod".into()
            })
        );
    }
}
