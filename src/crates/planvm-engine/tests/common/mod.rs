//! Shared fixtures for engine integration tests.

use planvm_core::{
    ConditionJudge, ConditionVerdict, Plan, ResponseFormat, ToolFailure, ToolHandler, ToolOutput,
    ToolRegistry, ToolSpec, VariableStore, VmError,
};
use planvm_engine::{EngineConfig, ExecutionEngine, PlanGenerator};
use planvm_store::{BranchStore, FsBranchStore};
use serde_json::{Map, Value};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use tempfile::TempDir;

/// Planner that replays scripted plans: `generate` pops from one queue,
/// `update`/`optimize_step` from another.
#[derive(Default)]
pub struct ScriptedPlanner {
    generations: Mutex<VecDeque<Plan>>,
    patches: Mutex<VecDeque<Plan>>,
}

impl ScriptedPlanner {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_generation(&self, json: &str) {
        self.generations
            .lock()
            .unwrap()
            .push_back(Plan::parse(json).expect("scripted plan"));
    }

    pub fn push_patch(&self, json: &str) {
        self.patches
            .lock()
            .unwrap()
            .push_back(Plan::parse(json).expect("scripted patch"));
    }
}

#[async_trait::async_trait]
impl PlanGenerator for ScriptedPlanner {
    async fn generate(
        &self,
        _goal: &str,
        _namespace: &str,
        _response_format: &ResponseFormat,
        _tool_catalog: &[ToolSpec],
        _best_practices_hint: Option<&str>,
    ) -> planvm_engine::Result<Plan> {
        self.generations
            .lock()
            .unwrap()
            .pop_front()
            .ok_or_else(|| {
                planvm_engine::EngineError::Vm(VmError::LlmParse {
                    message: "scripted planner ran out of generations".into(),
                })
            })
    }

    async fn update(
        &self,
        _plan: &Plan,
        _failing_seq_no: u64,
        _error_summary: &str,
        _variables: &VariableStore,
    ) -> planvm_engine::Result<Plan> {
        self.patches.lock().unwrap().pop_front().ok_or_else(|| {
            planvm_engine::EngineError::Vm(VmError::LlmParse {
                message: "scripted planner ran out of patches".into(),
            })
        })
    }

    async fn optimize_step(
        &self,
        _plan: &Plan,
        _seq_no: u64,
        _suggestion: &str,
        _variables: &VariableStore,
    ) -> planvm_engine::Result<Plan> {
        self.patches.lock().unwrap().pop_front().ok_or_else(|| {
            planvm_engine::EngineError::Vm(VmError::LlmParse {
                message: "scripted planner ran out of patches".into(),
            })
        })
    }
}

/// Judge that always answers the same way.
pub struct StaticJudge(pub bool);

#[async_trait::async_trait]
impl ConditionJudge for StaticJudge {
    async fn judge(
        &self,
        _prompt: &str,
        _context: Option<&str>,
    ) -> Result<ConditionVerdict, VmError> {
        Ok(ConditionVerdict {
            result: self.0,
            explanation: "scripted".into(),
        })
    }
}

/// Tool returning a fixed value.
pub struct StaticTool(pub Value);

#[async_trait::async_trait]
impl ToolHandler for StaticTool {
    async fn invoke(&self, _params: Map<String, Value>) -> Result<ToolOutput, ToolFailure> {
        match &self.0 {
            Value::Object(map) => Ok(ToolOutput::Keyed(map.clone())),
            other => Ok(ToolOutput::Single(other.clone())),
        }
    }
}

/// Tool that always fails fatally.
pub struct BrokenTool;

#[async_trait::async_trait]
impl ToolHandler for BrokenTool {
    async fn invoke(&self, _params: Map<String, Value>) -> Result<ToolOutput, ToolFailure> {
        Err(ToolFailure::fatal("backend exploded"))
    }
}

pub fn register(registry: &mut ToolRegistry, name: &str, handler: Arc<dyn ToolHandler>) {
    registry.register(
        ToolSpec {
            name: name.into(),
            description: format!("test tool {}", name),
            required_params: vec![],
        },
        handler,
    );
}

/// Engine over a filesystem store in a temp directory, with a scripted
/// planner and judge. The temp dir must outlive the engine.
pub struct Fixture {
    pub engine: ExecutionEngine,
    pub store: Arc<dyn BranchStore>,
    pub planner: Arc<ScriptedPlanner>,
    _dir: TempDir,
}

pub fn fixture_with(registry: ToolRegistry, judge: Arc<dyn ConditionJudge>) -> Fixture {
    let dir = tempfile::tempdir().expect("tempdir");
    let store: Arc<dyn BranchStore> =
        Arc::new(FsBranchStore::new(dir.path()).expect("fs store"));
    let planner = Arc::new(ScriptedPlanner::new());
    let engine = ExecutionEngine::new(
        store.clone(),
        Arc::new(registry),
        planner.clone(),
        judge,
        EngineConfig::default(),
    );
    Fixture { engine, store, planner, _dir: dir }
}

pub fn fixture() -> Fixture {
    fixture_with(ToolRegistry::new(), Arc::new(StaticJudge(true)))
}
