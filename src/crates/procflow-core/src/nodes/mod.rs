//! Node executors, one module per family
//!
//! Each node type has an executor implementing
//! [`NodeExecutor`](crate::executor::NodeExecutor). The families mirror the
//! node-type taxonomy:
//!
//! - [`flow`] - START, END, MERGE
//! - [`logic`] - CONDITION, SWITCH, LOOP, WHILE, PARALLEL, SUB_PROCESS
//! - [`task`] - AI_TASK, TOOL_CALL, SCRIPT
//! - [`integration`] - HTTP_REQUEST, DATABASE_QUERY, FILE_OPERATION,
//!   MESSAGE_QUEUE
//! - [`human`] - APPROVAL, HUMAN_TASK, NOTIFICATION
//! - [`data`] - TRANSFORM, VALIDATE, FILTER, MAP, AGGREGATE
//! - [`timing`] - DELAY, SCHEDULE, EVENT_WAIT

pub mod data;
pub mod flow;
pub mod human;
pub mod integration;
pub mod logic;
pub mod task;
pub mod timing;

use crate::definition::NodeType;
use crate::executor::ExecutorRegistry;
use serde_json::Value;

/// Equality across int/float representations, used by SWITCH case matching
pub(crate) fn loose_value_eq(left: &Value, right: &Value) -> bool {
    if let (Some(l), Some(r)) = (left.as_f64(), right.as_f64()) {
        return l == r;
    }
    left == right
}

/// Register every built-in executor
pub fn register_standard(registry: &mut ExecutorRegistry) {
    registry.register(NodeType::Start, flow::StartExecutor::new);
    registry.register(NodeType::End, flow::EndExecutor::new);
    registry.register(NodeType::Merge, flow::MergeExecutor::new);

    registry.register(NodeType::Condition, logic::ConditionExecutor::new);
    registry.register(NodeType::Switch, logic::SwitchExecutor::new);
    registry.register(NodeType::Loop, logic::LoopExecutor::new);
    registry.register(NodeType::While, logic::WhileExecutor::new);
    registry.register(NodeType::Parallel, logic::ParallelExecutor::new);
    registry.register(NodeType::SubProcess, logic::SubProcessExecutor::new);

    registry.register(NodeType::AiTask, task::AiTaskExecutor::new);
    registry.register(NodeType::ToolCall, task::ToolCallExecutor::new);
    registry.register(NodeType::Script, task::ScriptExecutor::new);

    registry.register(NodeType::HttpRequest, integration::HttpRequestExecutor::new);
    registry.register(
        NodeType::DatabaseQuery,
        integration::DatabaseQueryExecutor::new,
    );
    registry.register(
        NodeType::FileOperation,
        integration::FileOperationExecutor::new,
    );
    registry.register(
        NodeType::MessageQueue,
        integration::MessageQueueExecutor::new,
    );

    registry.register(NodeType::Approval, human::ApprovalExecutor::new);
    registry.register(NodeType::HumanTask, human::HumanTaskExecutor::new);
    registry.register(NodeType::Notification, human::NotificationExecutor::new);

    registry.register(NodeType::Transform, data::TransformExecutor::new);
    registry.register(NodeType::Validate, data::ValidateExecutor::new);
    registry.register(NodeType::Filter, data::FilterExecutor::new);
    registry.register(NodeType::Map, data::MapExecutor::new);
    registry.register(NodeType::Aggregate, data::AggregateExecutor::new);

    registry.register(NodeType::Delay, timing::DelayExecutor::new);
    registry.register(NodeType::Schedule, timing::ScheduleExecutor::new);
    registry.register(NodeType::EventWait, timing::EventWaitExecutor::new);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_standard_registry_covers_every_node_type() {
        let registry = ExecutorRegistry::standard();
        for node_type in [
            NodeType::Start,
            NodeType::End,
            NodeType::Merge,
            NodeType::Condition,
            NodeType::Switch,
            NodeType::Loop,
            NodeType::While,
            NodeType::Parallel,
            NodeType::SubProcess,
            NodeType::AiTask,
            NodeType::ToolCall,
            NodeType::Script,
            NodeType::HttpRequest,
            NodeType::DatabaseQuery,
            NodeType::FileOperation,
            NodeType::MessageQueue,
            NodeType::Approval,
            NodeType::HumanTask,
            NodeType::Notification,
            NodeType::Transform,
            NodeType::Validate,
            NodeType::Filter,
            NodeType::Map,
            NodeType::Aggregate,
            NodeType::Delay,
            NodeType::Schedule,
            NodeType::EventWait,
        ] {
            assert!(
                registry.is_registered(node_type),
                "missing executor for {node_type:?}"
            );
        }
    }
}
