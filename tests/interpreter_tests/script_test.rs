use std::sync::Arc;

use scriptworks::{
    ast::{BinaryOperator, CatchClause, Expression, Procedure, Statement, StatementKind},
    config::{InterpreterConfig, WorkerManagerConfig},
    error::ErrorKind,
    eval::{
        context::{BufferSink, SharedContext},
        value::Value,
    },
    tools::{ai_worker::register_ai_worker_tools, ToolRegistry},
    AIWorkerManager, Evaluator,
};
use tempfile::TempDir;

use crate::WORKER_DEFINITIONS;

struct Harness {
    evaluator: Evaluator,
    sink: Arc<BufferSink>,
    manager: Arc<AIWorkerManager>,
    _dir: TempDir,
}

fn harness(procedures: Vec<Procedure>) -> Harness {
    let dir = TempDir::new().unwrap();
    let manager = Arc::new(
        AIWorkerManager::new(
            dir.path(),
            None,
            WORKER_DEFINITIONS,
            "",
            WorkerManagerConfig::default(),
        )
        .unwrap(),
    );
    let mut tools = ToolRegistry::new();
    register_ai_worker_tools(&mut tools, manager.clone()).unwrap();

    let sink = Arc::new(BufferSink::new());
    let shared = SharedContext {
        tools: Arc::new(tools),
        procedures: Arc::new(procedures.into_iter().map(|p| (p.name.clone(), p)).collect()),
        sink: sink.clone(),
        llm: None,
        config: InterpreterConfig::default(),
    };
    Harness {
        evaluator: Evaluator::new(shared),
        sink,
        manager,
        _dir: dir,
    }
}

fn call_stmt(target: &str, args: Vec<Expression>) -> Statement {
    Statement::new(StatementKind::Call(Expression::call(target, args)))
}

fn on_error(block: Vec<Statement>) -> Statement {
    Statement::new(StatementKind::OnError(block))
}

#[tokio::test]
async fn test_script_drives_worker_lifecycle() {
    let h = harness(vec![]);
    let script = vec![
        Statement::set("topic", Expression::string("rust")),
        Statement::set(
            "id",
            Expression::call("tool.aiworker.SpawnInstance", vec![Expression::string("writer")]),
        ),
        Statement::set(
            "reply",
            Expression::call(
                "tool.aiworker.ExecuteOnInstance",
                vec![
                    Expression::var("id"),
                    Expression::raw_string("draft about {{topic}}"),
                ],
            ),
        ),
        Statement::emit(Expression::var("reply")),
        on_error(vec![
            Statement::emit(Expression::var("err_code")),
            Statement::new(StatementKind::ClearError),
        ]),
        // second instance exceeds the concurrency cap; the handler resumes
        Statement::set(
            "extra",
            Expression::call("tool.aiworker.SpawnInstance", vec![Expression::string("writer")]),
        ),
        call_stmt(
            "tool.aiworker.RetireInstance",
            vec![Expression::var("id"), Expression::string("done")],
        ),
        Statement::emit(Expression::index(
            Expression::LastResult,
            Expression::string("final_status"),
        )),
        Statement::ret(vec![Expression::string("finished")]),
    ];

    let result = h.evaluator.run_script(&script).await.unwrap();
    assert_eq!(result, Value::from("finished"));
    assert_eq!(
        h.sink.values(),
        vec![
            Value::from("Mock response from mock-model to: draft about rust"),
            Value::Integer(ErrorKind::RateLimited.code()),
            Value::from("retired_by_user"),
        ]
    );
    assert!(h.manager.list_active_worker_instances(None).await.is_empty());
    assert_eq!(h.manager.retired_instances().await.len(), 1);
}

#[tokio::test]
async fn test_catch_binds_rate_limit_error() {
    let h = harness(vec![]);
    let summarize = |text: &str| {
        Expression::call(
            "tool.aiworker.ExecuteStatelessTask",
            vec![Expression::string("summarizer"), Expression::string(text)],
        )
    };
    let script = vec![
        Statement::new(StatementKind::Try {
            try_block: vec![
                Statement::set("count", Expression::int(0)),
                Statement::new(StatementKind::ForEach {
                    variable: "text".to_string(),
                    collection: Expression::string("one, two, three"),
                    body: vec![
                        Statement::new(StatementKind::Call(summarize("x"))),
                        Statement::set(
                            "count",
                            Expression::binary(
                                BinaryOperator::Add,
                                Expression::var("count"),
                                Expression::int(1),
                            ),
                        ),
                    ],
                }),
            ],
            catch: Some(CatchClause {
                binding: Some("e".to_string()),
                statements: vec![
                    Statement::emit(Expression::index(
                        Expression::var("e"),
                        Expression::string("kind"),
                    )),
                    Statement::emit(Expression::var("count")),
                ],
            }),
            finally_block: None,
        }),
    ];

    h.evaluator.run_script(&script).await.unwrap();
    assert_eq!(
        h.sink.values(),
        vec![Value::from("RateLimited"), Value::Integer(2)]
    );
    assert_eq!(
        h.manager.task_records_for_definition("summarizer").await.len(),
        2
    );
}

#[tokio::test]
async fn test_procedure_wraps_worker_call() {
    let ask = Procedure::new(
        "ask",
        vec!["prompt".to_string()],
        vec![
            Statement::set(
                "answer",
                Expression::call(
                    "tool.aiworker.ExecuteStatelessTask",
                    vec![Expression::string("summarizer"), Expression::var("prompt")],
                ),
            ),
            Statement::new(StatementKind::Must(Expression::binary(
                BinaryOperator::NotEqual,
                Expression::var("answer"),
                Expression::null(),
            ))),
            Statement::ret(vec![Expression::var("answer")]),
        ],
    );
    let h = harness(vec![ask]);
    let answer = h
        .evaluator
        .run_procedure("ask", vec![Value::from("shorten")])
        .await
        .unwrap();
    assert_eq!(answer, Value::from("Mock response from mock-small to: shorten"));

    let err = h.evaluator.run_procedure("ask", vec![]).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ArgMismatch);
}

#[tokio::test]
async fn test_unhandled_tool_error_carries_position() {
    let h = harness(vec![]);
    let script = vec![
        Statement::set("x", Expression::int(1)),
        call_stmt(
            "tool.aiworker.ExecuteOnInstance",
            vec![Expression::string("no-such-instance"), Expression::string("hi")],
        )
        .at(7, 3),
    ];
    let err = h.evaluator.run_script(&script).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotFound);
    assert!(err.to_string().starts_with("at 7:3"));
}

#[tokio::test]
async fn test_list_definitions_from_script() {
    let h = harness(vec![]);
    let script = vec![
        Statement::set(
            "defs",
            Expression::call("tool.aiworker.ListDefinitions", vec![]),
        ),
        Statement::new(StatementKind::ForEach {
            variable: "d".to_string(),
            collection: Expression::var("defs"),
            body: vec![Statement::emit(Expression::index(
                Expression::var("d"),
                Expression::string("name"),
            ))],
        }),
    ];
    h.evaluator.run_script(&script).await.unwrap();
    // definitions are listed by name
    assert_eq!(
        h.sink.values(),
        vec![Value::from("summarizer"), Value::from("writer")]
    );
}
