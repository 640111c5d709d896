use std::collections::BTreeMap;
use std::sync::Arc;

use serde_json::{json, Value};

use procflow::{
    CreateFlowParam, FlowInstanceStatus, FlowModel, MemoryStore, NestingConfig, Node,
    NodeInstanceStatus, NodeKind, ProcessEngine, ProcflowError, SequenceFlow, StartProcessParam,
    UpdateFlowParam,
};

fn node(key: &str, kind: NodeKind, outgoing: Vec<SequenceFlow>) -> Node {
    Node {
        key: key.to_string(),
        name: None,
        kind,
        outgoing,
    }
}

fn flow_to(target: &str) -> SequenceFlow {
    SequenceFlow {
        target: target.to_string(),
        condition: None,
    }
}

async fn deploy(engine: &ProcessEngine, flow_key: &str, model: FlowModel) -> String {
    let flow_module_id = engine
        .create_flow(CreateFlowParam {
            flow_key: flow_key.to_string(),
            flow_name: flow_key.to_string(),
            operator: "tests".to_string(),
            remark: String::new(),
        })
        .await
        .unwrap();
    engine
        .update_flow(UpdateFlowParam {
            flow_module_id: flow_module_id.clone(),
            flow_model: Some(model),
            ..Default::default()
        })
        .await
        .unwrap();
    engine.deploy_flow(&flow_module_id).await.unwrap();
    flow_module_id
}

async fn start(
    engine: &ProcessEngine,
    flow_module_id: &str,
    variables: BTreeMap<String, Value>,
) -> procflow::Result<procflow::ProcessResult> {
    engine
        .start_process(StartProcessParam {
            flow_module_id: Some(flow_module_id.to_string()),
            variables,
            ..Default::default()
        })
        .await
}

/// start -> call(called_flow_key) -> end
fn caller_model(called_flow_key: &str) -> FlowModel {
    FlowModel {
        nodes: vec![
            node("start", NodeKind::StartEvent, vec![flow_to("call")]),
            node(
                "call",
                NodeKind::CallActivity {
                    called_flow_key: called_flow_key.to_string(),
                },
                vec![flow_to("end")],
            ),
            node("end", NodeKind::EndEvent, vec![]),
        ],
    }
}

fn leaf_model() -> FlowModel {
    FlowModel {
        nodes: vec![
            node("start", NodeKind::StartEvent, vec![flow_to("end")]),
            node("end", NodeKind::EndEvent, vec![]),
        ],
    }
}

#[tokio::test]
async fn sub_flow_suspends_the_parent_and_merges_its_output() {
    let engine = ProcessEngine::new(Arc::new(MemoryStore::new()));
    let sub = FlowModel {
        nodes: vec![
            node("sub_start", NodeKind::StartEvent, vec![flow_to("st")]),
            node("st", NodeKind::UserTask, vec![flow_to("sub_end")]),
            node("sub_end", NodeKind::EndEvent, vec![]),
        ],
    };
    deploy(&engine, "approval", sub).await;
    let parent_model = FlowModel {
        nodes: vec![
            node("start", NodeKind::StartEvent, vec![flow_to("call")]),
            node(
                "call",
                NodeKind::CallActivity {
                    called_flow_key: "approval".to_string(),
                },
                vec![flow_to("qt")],
            ),
            node("qt", NodeKind::UserTask, vec![flow_to("end")]),
            node("end", NodeKind::EndEvent, vec![]),
        ],
    };
    let parent_module = deploy(&engine, "order", parent_model).await;

    let mut input = BTreeMap::new();
    input.insert("amount".to_string(), json!(100));
    let started = start(&engine, &parent_module, input).await.unwrap();
    let parent_id = started.flow_instance_id.clone();

    // 挂起点在子流程的任务上
    let st = started.active_task.unwrap();
    assert_eq!(st.node_key, "st");
    assert_ne!(st.flow_instance_id, parent_id);

    // 子实例继承父变量作为启动输入
    let child_data = engine
        .get_instance_data(&st.flow_instance_id, None, false)
        .await
        .unwrap();
    assert_eq!(
        child_data.iter().find(|d| d.key == "amount").unwrap().value,
        json!(100)
    );

    let mut approval = BTreeMap::new();
    approval.insert("approved".to_string(), json!(true));
    let resumed = engine
        .commit_task(&st.flow_instance_id, &st.node_instance_id, approval)
        .await
        .unwrap();

    // 子流程完成后父流程继续驱动到自己的任务
    assert_eq!(resumed.flow_instance_id, parent_id);
    assert_eq!(resumed.active_task.unwrap().node_key, "qt");

    let child = engine.get_flow_instance(&st.flow_instance_id).await.unwrap();
    assert_eq!(child.status, FlowInstanceStatus::Completed);

    let parent_data = engine
        .get_instance_data(&parent_id, None, false)
        .await
        .unwrap();
    assert_eq!(
        parent_data
            .iter()
            .find(|d| d.key == "approved")
            .unwrap()
            .value,
        json!(true)
    );
}

#[tokio::test]
async fn automatic_sub_flow_completes_inline() {
    let engine = ProcessEngine::new(Arc::new(MemoryStore::new()));
    deploy(&engine, "noop", leaf_model()).await;
    let parent_model = FlowModel {
        nodes: vec![
            node("start", NodeKind::StartEvent, vec![flow_to("call")]),
            node(
                "call",
                NodeKind::CallActivity {
                    called_flow_key: "noop".to_string(),
                },
                vec![flow_to("pt")],
            ),
            node("pt", NodeKind::UserTask, vec![flow_to("end")]),
            node("end", NodeKind::EndEvent, vec![]),
        ],
    };
    let parent_module = deploy(&engine, "wrapper", parent_model).await;

    let started = start(&engine, &parent_module, BTreeMap::new())
        .await
        .unwrap();
    assert_eq!(started.active_task.unwrap().node_key, "pt");

    // 子流程的轨迹紧随 CallActivity 内联展开
    let elements = engine
        .get_history_element_list(&started.flow_instance_id, true)
        .await
        .unwrap();
    let keys: Vec<&str> = elements.iter().map(|e| e.node_key.as_str()).collect();
    assert_eq!(keys, vec!["start", "call", "sub_start", "sub_end", "pt"]);

    let call_ni = elements.iter().find(|e| e.node_key == "call").unwrap();
    assert_eq!(call_ni.status, NodeInstanceStatus::Completed);
    let child_id = call_ni.child_flow_instance_id.clone().unwrap();
    let child = engine.get_flow_instance(&child_id).await.unwrap();
    assert_eq!(child.status, FlowInstanceStatus::Completed);
}

#[tokio::test]
async fn nesting_beyond_the_configured_level_is_rejected() {
    let engine = ProcessEngine::new(Arc::new(MemoryStore::new()))
        .with_nesting_config(NestingConfig::new().with_level("top", 1));
    deploy(&engine, "leaf", leaf_model()).await;
    deploy(&engine, "mid", caller_model("leaf")).await;
    let top_module = deploy(&engine, "top", caller_model("mid")).await;

    let err = start(&engine, &top_module, BTreeMap::new())
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        ProcflowError::NestedLevelExceeded { ref flow_key, limit: 1 } if flow_key.as_str() == "top"
    ));
    assert_eq!(err.code(), 4006);
}

#[tokio::test]
async fn nesting_within_the_configured_level_succeeds() {
    let engine = ProcessEngine::new(Arc::new(MemoryStore::new()))
        .with_nesting_config(NestingConfig::new().with_level("top", 2));
    deploy(&engine, "leaf", leaf_model()).await;
    deploy(&engine, "mid", caller_model("leaf")).await;
    let top_module = deploy(&engine, "top", caller_model("mid")).await;

    let result = start(&engine, &top_module, BTreeMap::new()).await.unwrap();
    assert_eq!(result.status, FlowInstanceStatus::Completed);
    assert!(result.active_task.is_none());
}

#[tokio::test]
async fn zero_level_forbids_any_sub_flow() {
    let engine = ProcessEngine::new(Arc::new(MemoryStore::new()))
        .with_nesting_config(NestingConfig::new().with_level("top", 0));
    deploy(&engine, "leaf", leaf_model()).await;
    let top_module = deploy(&engine, "top", caller_model("leaf")).await;

    let err = start(&engine, &top_module, BTreeMap::new())
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        ProcflowError::NestedLevelExceeded { limit: 0, .. }
    ));
}

#[tokio::test]
async fn unconfigured_flows_use_the_hard_cap() {
    // 未配置的 key 走默认上限，两层嵌套远在其下
    let engine = ProcessEngine::new(Arc::new(MemoryStore::new()))
        .with_nesting_config(NestingConfig::new());
    deploy(&engine, "leaf", leaf_model()).await;
    deploy(&engine, "mid", caller_model("leaf")).await;
    let top_module = deploy(&engine, "top", caller_model("mid")).await;

    let result = start(&engine, &top_module, BTreeMap::new()).await.unwrap();
    assert_eq!(result.status, FlowInstanceStatus::Completed);
}

#[tokio::test]
async fn terminate_cascades_into_suspended_sub_flows() {
    let engine = ProcessEngine::new(Arc::new(MemoryStore::new()));
    let sub = FlowModel {
        nodes: vec![
            node("sub_start", NodeKind::StartEvent, vec![flow_to("st")]),
            node("st", NodeKind::UserTask, vec![flow_to("sub_end")]),
            node("sub_end", NodeKind::EndEvent, vec![]),
        ],
    };
    deploy(&engine, "task-flow", sub).await;
    let top_module = deploy(&engine, "top", caller_model("task-flow")).await;

    let started = start(&engine, &top_module, BTreeMap::new()).await.unwrap();
    let st = started.active_task.unwrap();
    let child_id = st.flow_instance_id.clone();

    let result = engine
        .terminate_process(&started.flow_instance_id, true)
        .await
        .unwrap();
    assert_eq!(result.status, FlowInstanceStatus::Terminated);

    let child = engine.get_flow_instance(&child_id).await.unwrap();
    assert_eq!(child.status, FlowInstanceStatus::Terminated);
    let st_after = engine
        .get_node_instance(&child_id, &st.node_instance_id, false)
        .await
        .unwrap();
    assert_eq!(st_after.status, NodeInstanceStatus::Terminated);

    // 子流程已终止，挂起的任务不可再提交
    let err = engine
        .commit_task(&child_id, &st.node_instance_id, BTreeMap::new())
        .await
        .unwrap_err();
    assert!(matches!(err, ProcflowError::InvalidState(_)));
}

#[tokio::test]
async fn terminate_without_cascade_leaves_children_alone() {
    let engine = ProcessEngine::new(Arc::new(MemoryStore::new()));
    let sub = FlowModel {
        nodes: vec![
            node("sub_start", NodeKind::StartEvent, vec![flow_to("st")]),
            node("st", NodeKind::UserTask, vec![flow_to("sub_end")]),
            node("sub_end", NodeKind::EndEvent, vec![]),
        ],
    };
    deploy(&engine, "detached", sub).await;
    let top_module = deploy(&engine, "top", caller_model("detached")).await;

    let started = start(&engine, &top_module, BTreeMap::new()).await.unwrap();
    let st = started.active_task.unwrap();
    let child_id = st.flow_instance_id.clone();

    engine
        .terminate_process(&started.flow_instance_id, false)
        .await
        .unwrap();

    let parent = engine
        .get_flow_instance(&started.flow_instance_id)
        .await
        .unwrap();
    assert_eq!(parent.status, FlowInstanceStatus::Terminated);
    let child = engine.get_flow_instance(&child_id).await.unwrap();
    assert_eq!(child.status, FlowInstanceStatus::Active);
}
