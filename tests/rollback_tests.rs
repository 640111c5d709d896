use std::collections::BTreeMap;
use std::sync::Arc;

use serde_json::{json, Value};

use procflow::{
    CreateFlowParam, FlowInstanceStatus, FlowModel, MemoryStore, Node, NodeInstanceStatus,
    NodeKind, ProcessEngine, ProcflowError, SequenceFlow, StartProcessParam, UpdateFlowParam,
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
) -> procflow::ProcessResult {
    engine
        .start_process(StartProcessParam {
            flow_module_id: Some(flow_module_id.to_string()),
            variables,
            ..Default::default()
        })
        .await
        .unwrap()
}

fn vars(pairs: &[(&str, Value)]) -> BTreeMap<String, Value> {
    pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.clone()))
        .collect()
}

fn two_task_model() -> FlowModel {
    FlowModel {
        nodes: vec![
            node("start", NodeKind::StartEvent, vec![flow_to("t1")]),
            node("t1", NodeKind::UserTask, vec![flow_to("t2")]),
            node("t2", NodeKind::UserTask, vec![flow_to("end")]),
            node("end", NodeKind::EndEvent, vec![]),
        ],
    }
}

// 模型里没有并行网关，实例内任意时刻只有一条活动路径，
// 回滚因此可以按 sequence 倒序处理单链历史。

// 回滚是提交的逆操作：停靠点和变量快照都要回到提交前
#[tokio::test]
async fn rollback_reverts_the_previous_commit() {
    let engine = ProcessEngine::new(Arc::new(MemoryStore::new()));
    let module_id = deploy(&engine, "reversible", two_task_model()).await;

    let started = start(&engine, &module_id, vars(&[("a", json!(1))])).await;
    let t1 = started.active_task.unwrap();
    let after_commit = engine
        .commit_task(
            &t1.flow_instance_id,
            &t1.node_instance_id,
            vars(&[("v", json!(5))]),
        )
        .await
        .unwrap();
    let t2 = after_commit.active_task.unwrap();
    assert_eq!(t2.node_key, "t2");

    let rolled = engine
        .rollback_task(&t2.flow_instance_id, &t2.node_instance_id)
        .await
        .unwrap();
    let reactivated = rolled.active_task.unwrap();
    assert_eq!(reactivated.node_instance_id, t1.node_instance_id);
    assert_eq!(reactivated.status, NodeInstanceStatus::Active);

    // 被回滚的任务作废，提交带入的变量被回退
    let disabled = engine
        .get_node_instance(&t2.flow_instance_id, &t2.node_instance_id, false)
        .await
        .unwrap();
    assert_eq!(disabled.status, NodeInstanceStatus::Disabled);

    let data = engine
        .get_instance_data(&started.flow_instance_id, None, false)
        .await
        .unwrap();
    assert!(data.iter().any(|d| d.key == "a"));
    assert!(!data.iter().any(|d| d.key == "v"));

    let tasks = engine
        .get_history_user_task_list(&started.flow_instance_id, false)
        .await
        .unwrap();
    assert_eq!(tasks.len(), 1);
    assert_eq!(tasks[0].node_key, "t1");

    // 重新提交走到 t2 的新实例
    let recommitted = engine
        .commit_task(
            &t1.flow_instance_id,
            &t1.node_instance_id,
            vars(&[("v", json!(7))]),
        )
        .await
        .unwrap();
    let t2_again = recommitted.active_task.unwrap();
    assert_eq!(t2_again.node_key, "t2");
    assert_ne!(t2_again.node_instance_id, t2.node_instance_id);

    let data = engine
        .get_instance_data(&started.flow_instance_id, None, false)
        .await
        .unwrap();
    assert_eq!(data.iter().find(|d| d.key == "v").unwrap().value, json!(7));
}

#[tokio::test]
async fn rollback_of_the_first_task_reaches_the_start_event() {
    let engine = ProcessEngine::new(Arc::new(MemoryStore::new()));
    let module_id = deploy(&engine, "restartable", two_task_model()).await;

    let started = start(&engine, &module_id, vars(&[("x", json!(1))])).await;
    let t1 = started.active_task.unwrap();

    let rolled = engine
        .rollback_task(&t1.flow_instance_id, &t1.node_instance_id)
        .await
        .unwrap();
    assert!(rolled.active_task.is_none());
    assert_eq!(rolled.status, FlowInstanceStatus::Active);

    // 停靠在重新激活的开始事件上，提交等价于重新启动
    let instance = engine
        .get_flow_instance(&started.flow_instance_id)
        .await
        .unwrap();
    let start_ni_id = instance.current_node_instance_id.expect("start event active");
    let start_ni = engine
        .get_node_instance(&started.flow_instance_id, &start_ni_id, false)
        .await
        .unwrap();
    assert_eq!(start_ni.node_key, "start");
    assert_eq!(start_ni.status, NodeInstanceStatus::Active);

    let restarted = engine
        .commit_task(&started.flow_instance_id, &start_ni_id, vars(&[("x", json!(2))]))
        .await
        .unwrap();
    let t1_again = restarted.active_task.unwrap();
    assert_eq!(t1_again.node_key, "t1");
    assert_ne!(t1_again.node_instance_id, t1.node_instance_id);

    let data = engine
        .get_instance_data(&started.flow_instance_id, None, false)
        .await
        .unwrap();
    assert_eq!(data.iter().find(|d| d.key == "x").unwrap().value, json!(2));
}

#[tokio::test]
async fn rollback_crosses_a_completed_call_activity() {
    let engine = ProcessEngine::new(Arc::new(MemoryStore::new()));
    let sub = FlowModel {
        nodes: vec![
            node("sub_start", NodeKind::StartEvent, vec![flow_to("st")]),
            node("st", NodeKind::UserTask, vec![flow_to("sub_end")]),
            node("sub_end", NodeKind::EndEvent, vec![]),
        ],
    };
    deploy(&engine, "review", sub).await;
    let parent_model = FlowModel {
        nodes: vec![
            node("start", NodeKind::StartEvent, vec![flow_to("pt")]),
            node("pt", NodeKind::UserTask, vec![flow_to("call")]),
            node(
                "call",
                NodeKind::CallActivity {
                    called_flow_key: "review".to_string(),
                },
                vec![flow_to("qt")],
            ),
            node("qt", NodeKind::UserTask, vec![flow_to("end")]),
            node("end", NodeKind::EndEvent, vec![]),
        ],
    };
    let parent_module = deploy(&engine, "escalation", parent_model).await;

    let started = start(&engine, &parent_module, BTreeMap::new()).await;
    let parent_id = started.flow_instance_id.clone();
    let pt = started.active_task.unwrap();
    let suspended = engine
        .commit_task(&pt.flow_instance_id, &pt.node_instance_id, BTreeMap::new())
        .await
        .unwrap();
    let st = suspended.active_task.unwrap();
    assert_eq!(st.node_key, "st");
    let child_id = st.flow_instance_id.clone();
    assert_ne!(child_id, parent_id);

    let resumed = engine
        .commit_task(&st.flow_instance_id, &st.node_instance_id, vars(&[("k", json!(1))]))
        .await
        .unwrap();
    let qt = resumed.active_task.unwrap();
    assert_eq!(qt.node_key, "qt");

    // 回滚越过已完成的 CallActivity，停靠在子流程的任务上
    let rolled = engine
        .rollback_task(&parent_id, &qt.node_instance_id)
        .await
        .unwrap();
    let st_again = rolled.active_task.unwrap();
    assert_eq!(st_again.node_key, "st");
    assert_eq!(st_again.node_instance_id, st.node_instance_id);
    assert_eq!(st_again.flow_instance_id, child_id);

    let child = engine.get_flow_instance(&child_id).await.unwrap();
    assert_eq!(child.status, FlowInstanceStatus::Active);

    // 再次提交子任务，父流程回到 qt
    let replayed = engine
        .commit_task(&child_id, &st.node_instance_id, vars(&[("k", json!(2))]))
        .await
        .unwrap();
    let qt_again = replayed.active_task.unwrap();
    assert_eq!(qt_again.node_key, "qt");
    assert_eq!(qt_again.flow_instance_id, parent_id);

    let data = engine
        .get_instance_data(&parent_id, None, false)
        .await
        .unwrap();
    assert_eq!(data.iter().find(|d| d.key == "k").unwrap().value, json!(2));
}

#[tokio::test]
async fn rollback_climbs_out_of_a_sub_flow_without_earlier_tasks() {
    let engine = ProcessEngine::new(Arc::new(MemoryStore::new()));
    let sub = FlowModel {
        nodes: vec![
            node("sub_start", NodeKind::StartEvent, vec![flow_to("st")]),
            node("st", NodeKind::UserTask, vec![flow_to("sub_end")]),
            node("sub_end", NodeKind::EndEvent, vec![]),
        ],
    };
    deploy(&engine, "inner", sub).await;
    let parent_model = FlowModel {
        nodes: vec![
            node("start", NodeKind::StartEvent, vec![flow_to("pt")]),
            node("pt", NodeKind::UserTask, vec![flow_to("call")]),
            node(
                "call",
                NodeKind::CallActivity {
                    called_flow_key: "inner".to_string(),
                },
                vec![flow_to("end")],
            ),
            node("end", NodeKind::EndEvent, vec![]),
        ],
    };
    let parent_module = deploy(&engine, "outer", parent_model).await;

    let started = start(&engine, &parent_module, BTreeMap::new()).await;
    let parent_id = started.flow_instance_id.clone();
    let pt = started.active_task.unwrap();
    let suspended = engine
        .commit_task(&pt.flow_instance_id, &pt.node_instance_id, BTreeMap::new())
        .await
        .unwrap();
    let st = suspended.active_task.unwrap();
    let child_id = st.flow_instance_id.clone();

    // 子流程内没有更早的任务：整个子流程作废，停靠回父流程的 pt
    let rolled = engine
        .rollback_task(&parent_id, &st.node_instance_id)
        .await
        .unwrap();
    let pt_again = rolled.active_task.unwrap();
    assert_eq!(pt_again.node_key, "pt");
    assert_eq!(pt_again.node_instance_id, pt.node_instance_id);
    assert_eq!(pt_again.flow_instance_id, parent_id);

    let child = engine.get_flow_instance(&child_id).await.unwrap();
    assert_eq!(child.status, FlowInstanceStatus::Terminated);

    // 作废的 CallActivity 不再出现在元素轨迹里
    let elements = engine
        .get_history_element_list(&parent_id, true)
        .await
        .unwrap();
    assert!(elements.iter().all(|e| e.node_key != "call"));
}

#[tokio::test]
async fn rollback_rejects_non_active_targets() {
    let engine = ProcessEngine::new(Arc::new(MemoryStore::new()));
    let module_id = deploy(&engine, "guarded", two_task_model()).await;

    let started = start(&engine, &module_id, BTreeMap::new()).await;
    let t1 = started.active_task.unwrap();
    engine
        .commit_task(&t1.flow_instance_id, &t1.node_instance_id, BTreeMap::new())
        .await
        .unwrap();

    // 已完成的任务不能作为回滚目标
    let err = engine
        .rollback_task(&started.flow_instance_id, &t1.node_instance_id)
        .await
        .unwrap_err();
    assert!(matches!(err, ProcflowError::InvalidState(_)));
}
