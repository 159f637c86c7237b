use actix_web::{delete, get, post, web, HttpResponse, Responder, Result as ActixResult};
use actix_ws::Message;
use canvascore::{GraphDocument, Value, WorkflowError};
use canvasruntime::FlowRuntime;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::RwLock;
use tracing::{error, info, warn};
use uuid::Uuid;

/// Application state shared across handlers
pub struct AppState {
    pub runtime: Arc<FlowRuntime>,
    pub workflows: RwLock<HashMap<Uuid, Arc<SavedWorkflow>>>,
}

impl AppState {
    pub fn new(runtime: FlowRuntime) -> Self {
        Self {
            runtime: Arc::new(runtime),
            workflows: RwLock::new(HashMap::new()),
        }
    }
}

/// Immutable snapshot of a graph stored by the server.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SavedWorkflow {
    pub id: Uuid,
    pub name: String,
    pub created_at: DateTime<Utc>,
    pub graph: GraphDocument,
}

#[derive(Debug, Deserialize)]
struct CreateWorkflowRequest {
    #[serde(default)]
    name: Option<String>,
    graph: GraphDocument,
}

/// Request body for workflow execution
#[derive(Debug, Default, Deserialize)]
struct ExecuteRequest {
    #[serde(default)]
    inputs: BTreeMap<String, Value>,
}

#[derive(Debug, Serialize)]
struct ErrorResponse {
    error: String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    issues: Vec<canvascore::WorkflowIssue>,
}

impl ErrorResponse {
    fn new(error: impl Into<String>) -> Self {
        Self {
            error: error.into(),
            issues: Vec::new(),
        }
    }
}

fn workflow_error(err: WorkflowError) -> HttpResponse {
    let body = ErrorResponse {
        error: err.to_string(),
        issues: err.issues().to_vec(),
    };
    match err {
        WorkflowError::Invalid(_) => HttpResponse::UnprocessableEntity().json(body),
        WorkflowError::TemplateNotFound(_) => HttpResponse::NotFound().json(body),
        WorkflowError::Template { .. } => HttpResponse::InternalServerError().json(body),
    }
}

#[get("/health")]
async fn health_check() -> impl Responder {
    HttpResponse::Ok().json(serde_json::json!({
        "status": "healthy",
        "version": env!("CARGO_PKG_VERSION"),
        "service": "canvas"
    }))
}

#[get("/api/node-types")]
async fn list_node_types(data: web::Data<AppState>) -> impl Responder {
    let types: Vec<_> = data.runtime.registry().list().collect();
    HttpResponse::Ok().json(types)
}

#[get("/api/templates")]
async fn list_templates(data: web::Data<AppState>) -> impl Responder {
    let templates: Vec<_> = data
        .runtime
        .templates()
        .list()
        .map(|t| {
            serde_json::json!({
                "name": t.name,
                "description": t.description,
                "nodes": t.nodes.len(),
                "connections": t.connections.len(),
            })
        })
        .collect();
    HttpResponse::Ok().json(templates)
}

/// Instantiate a template and return it as an editable graph document.
#[post("/api/templates/{name}/instantiate")]
async fn instantiate_template(
    data: web::Data<AppState>,
    path: web::Path<String>,
) -> ActixResult<impl Responder> {
    let name = path.into_inner();
    Ok(match data.runtime.graph_from_template(&name) {
        Ok(graph) => HttpResponse::Ok().json(graph.save()),
        Err(err) => workflow_error(err),
    })
}

#[get("/api/workflows")]
async fn list_workflows(data: web::Data<AppState>) -> impl Responder {
    let workflows = data.workflows.read().await;
    let mut list: Vec<_> = workflows.values().cloned().collect();
    list.sort_by_key(|w| w.created_at);
    let summaries: Vec<_> = list
        .iter()
        .map(|w| {
            serde_json::json!({
                "id": w.id,
                "name": w.name,
                "createdAt": w.created_at,
                "nodes": w.graph.nodes.len(),
                "connections": w.graph.connections.len(),
            })
        })
        .collect();
    HttpResponse::Ok().json(summaries)
}

/// Store a graph. The document must load; it need not be valid.
#[post("/api/workflows")]
async fn create_workflow(
    data: web::Data<AppState>,
    req: web::Json<CreateWorkflowRequest>,
) -> ActixResult<impl Responder> {
    let req = req.into_inner();
    let graph = match data.runtime.load_document(&req.graph) {
        Ok(graph) => graph,
        Err(e) => return Ok(HttpResponse::BadRequest().json(ErrorResponse::new(e.to_string()))),
    };

    let id = Uuid::new_v4();
    let saved = Arc::new(SavedWorkflow {
        id,
        name: req.name.unwrap_or_else(|| format!("workflow-{}", id)),
        created_at: Utc::now(),
        graph: graph.save(),
    });
    info!("Saved workflow: {} ({})", saved.name, id);
    data.workflows.write().await.insert(id, saved.clone());

    Ok(HttpResponse::Created().json(saved.as_ref()))
}

async fn find_workflow(data: &AppState, id: Uuid) -> Result<Arc<SavedWorkflow>, HttpResponse> {
    data.workflows
        .read()
        .await
        .get(&id)
        .cloned()
        .ok_or_else(|| {
            HttpResponse::NotFound().json(ErrorResponse::new(format!("Workflow {} not found", id)))
        })
}

#[get("/api/workflows/{id}")]
async fn get_workflow(
    data: web::Data<AppState>,
    path: web::Path<Uuid>,
) -> ActixResult<impl Responder> {
    Ok(match find_workflow(&data, path.into_inner()).await {
        Ok(saved) => HttpResponse::Ok().json(saved.as_ref()),
        Err(response) => response,
    })
}

#[delete("/api/workflows/{id}")]
async fn delete_workflow(
    data: web::Data<AppState>,
    path: web::Path<Uuid>,
) -> ActixResult<impl Responder> {
    let id = path.into_inner();
    Ok(match data.workflows.write().await.remove(&id) {
        Some(_) => {
            info!("Deleted workflow: {}", id);
            HttpResponse::NoContent().finish()
        }
        None => HttpResponse::NotFound().json(ErrorResponse::new(format!("Workflow {} not found", id))),
    })
}

fn validate_document(runtime: &FlowRuntime, document: &GraphDocument) -> HttpResponse {
    match runtime.load_document(document) {
        Ok(graph) => HttpResponse::Ok().json(runtime.validate(&graph)),
        Err(e) => HttpResponse::BadRequest().json(ErrorResponse::new(e.to_string())),
    }
}

#[post("/api/workflows/{id}/validate")]
async fn validate_workflow(
    data: web::Data<AppState>,
    path: web::Path<Uuid>,
) -> ActixResult<impl Responder> {
    Ok(match find_workflow(&data, path.into_inner()).await {
        Ok(saved) => validate_document(&data.runtime, &saved.graph),
        Err(response) => response,
    })
}

#[post("/api/validate")]
async fn validate_graph(
    data: web::Data<AppState>,
    document: web::Json<GraphDocument>,
) -> ActixResult<impl Responder> {
    Ok(validate_document(&data.runtime, &document))
}

#[post("/api/workflows/{id}/execute")]
async fn execute_workflow(
    data: web::Data<AppState>,
    path: web::Path<Uuid>,
    req: Option<web::Json<ExecuteRequest>>,
) -> ActixResult<impl Responder> {
    let saved = match find_workflow(&data, path.into_inner()).await {
        Ok(saved) => saved,
        Err(response) => return Ok(response),
    };
    let inputs = req.map(|r| r.into_inner()).unwrap_or_default().inputs;
    let graph = match data.runtime.load_document(&saved.graph) {
        Ok(graph) => graph,
        Err(e) => {
            error!("Stored workflow {} no longer loads: {}", saved.id, e);
            return Ok(HttpResponse::InternalServerError().json(ErrorResponse::new(e.to_string())));
        }
    };

    info!("Executing workflow: {}", saved.id);
    Ok(match data.runtime.run(&graph, inputs).await {
        Ok(result) => {
            info!(
                "Workflow {} finished: {} executed, {} failed",
                saved.id,
                result.executed_count(),
                result.failures.len()
            );
            HttpResponse::Ok().json(result)
        }
        Err(err) => {
            warn!("Workflow {} rejected: {}", saved.id, err);
            workflow_error(err)
        }
    })
}

/// WebSocket endpoint for real-time events
#[get("/api/events")]
async fn websocket_events(
    req: actix_web::HttpRequest,
    stream: web::Payload,
    data: web::Data<AppState>,
) -> ActixResult<HttpResponse> {
    let (res, mut session, mut msg_stream) = actix_ws::handle(&req, stream)?;

    info!("WebSocket client connected");
    let mut events = data.runtime.subscribe_events();

    actix_web::rt::spawn(async move {
        loop {
            tokio::select! {
                event = events.recv() => {
                    match event {
                        Ok(event) => {
                            if let Ok(json) = serde_json::to_string(&event) {
                                if session.text(json).await.is_err() {
                                    break;
                                }
                            }
                        }
                        Err(RecvError::Lagged(missed)) => {
                            warn!("WebSocket client lagged, {} event(s) dropped", missed);
                        }
                        Err(RecvError::Closed) => break,
                    }
                }

                Some(Ok(msg)) = msg_stream.recv() => {
                    match msg {
                        Message::Ping(bytes) => {
                            if session.pong(&bytes).await.is_err() {
                                break;
                            }
                        }
                        Message::Close(_) => break,
                        _ => {}
                    }
                }

                else => break,
            }
        }

        info!("WebSocket client disconnected");
        let _ = session.close(None).await;
    });

    Ok(res)
}

pub fn configure(cfg: &mut web::ServiceConfig) {
    cfg.service(health_check)
        .service(list_node_types)
        .service(list_templates)
        .service(instantiate_template)
        .service(list_workflows)
        .service(create_workflow)
        .service(get_workflow)
        .service(delete_workflow)
        .service(validate_workflow)
        .service(execute_workflow)
        .service(validate_graph)
        .service(websocket_events);
}

#[cfg(test)]
mod tests {
    use super::*;
    use actix_web::{http::StatusCode, test, App};
    use canvascore::{PortRef, Position};
    use canvasnodes::Settings;
    use serde_json::json;

    fn state() -> web::Data<AppState> {
        let runtime = Settings::default().build_runtime().unwrap();
        web::Data::new(AppState::new(runtime))
    }

    fn echo_document(state: &AppState) -> GraphDocument {
        let runtime = &state.runtime;
        let mut graph = runtime.new_graph();
        let input = graph.add_node("input", Position::default()).unwrap();
        let echo = graph.add_node("debug.echo", Position::default()).unwrap();
        let out = graph.add_node("output", Position::default()).unwrap();
        graph
            .connect(PortRef::new(input, "output"), PortRef::new(echo, "input"))
            .unwrap();
        graph
            .connect(PortRef::new(echo, "output"), PortRef::new(out, "input"))
            .unwrap();
        graph.save()
    }

    #[actix_web::test]
    async fn test_health_and_catalogues() {
        let app = test::init_service(App::new().app_data(state()).configure(configure)).await;

        let req = test::TestRequest::get().uri("/health").to_request();
        let body: serde_json::Value = test::call_and_read_body_json(&app, req).await;
        assert_eq!(body["status"], "healthy");

        let req = test::TestRequest::get().uri("/api/node-types").to_request();
        let body: serde_json::Value = test::call_and_read_body_json(&app, req).await;
        let ids: Vec<&str> = body
            .as_array()
            .unwrap()
            .iter()
            .filter_map(|t| t["id"].as_str())
            .collect();
        assert!(ids.contains(&"decision"));
        assert!(ids.contains(&"debug.echo"));

        let req = test::TestRequest::get().uri("/api/templates").to_request();
        let body: serde_json::Value = test::call_and_read_body_json(&app, req).await;
        assert_eq!(body.as_array().unwrap().len(), 3);
    }

    #[actix_web::test]
    async fn test_instantiate_template() {
        let app = test::init_service(App::new().app_data(state()).configure(configure)).await;

        let req = test::TestRequest::post()
            .uri("/api/templates/brand-analysis/instantiate")
            .to_request();
        let body: serde_json::Value = test::call_and_read_body_json(&app, req).await;
        assert_eq!(body["nodes"].as_array().unwrap().len(), 3);
        assert_eq!(body["connections"].as_array().unwrap().len(), 2);

        let req = test::TestRequest::post()
            .uri("/api/templates/nope/instantiate")
            .to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }

    #[actix_web::test]
    async fn test_workflow_lifecycle() {
        let state = state();
        let document = echo_document(&state);
        let app = test::init_service(App::new().app_data(state.clone()).configure(configure)).await;

        let req = test::TestRequest::post()
            .uri("/api/workflows")
            .set_json(json!({ "name": "echo", "graph": document }))
            .to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), StatusCode::CREATED);
        let created: serde_json::Value = test::read_body_json(resp).await;
        let id = created["id"].as_str().unwrap().to_string();

        let req = test::TestRequest::post()
            .uri(&format!("/api/workflows/{}/validate", id))
            .to_request();
        let report: serde_json::Value = test::call_and_read_body_json(&app, req).await;
        assert_eq!(report["isValid"], true);

        let req = test::TestRequest::post()
            .uri(&format!("/api/workflows/{}/execute", id))
            .set_json(json!({ "inputs": { "input": "hello" } }))
            .to_request();
        let result: serde_json::Value = test::call_and_read_body_json(&app, req).await;
        assert_eq!(result["outputs"]["result"], "hello");

        let req = test::TestRequest::get().uri("/api/workflows").to_request();
        let list: serde_json::Value = test::call_and_read_body_json(&app, req).await;
        assert_eq!(list.as_array().unwrap().len(), 1);

        let req = test::TestRequest::delete()
            .uri(&format!("/api/workflows/{}", id))
            .to_request();
        assert_eq!(test::call_service(&app, req).await.status(), StatusCode::NO_CONTENT);

        let req = test::TestRequest::get()
            .uri(&format!("/api/workflows/{}", id))
            .to_request();
        assert_eq!(test::call_service(&app, req).await.status(), StatusCode::NOT_FOUND);
    }

    #[actix_web::test]
    async fn test_invalid_graph_is_rejected() {
        let app = test::init_service(App::new().app_data(state()).configure(configure)).await;
        let cyclic = json!({
            "nodes": [
                {"id": 1, "type": "transform"},
                {"id": 2, "type": "transform"}
            ],
            "connections": [
                {"id": 1, "from": {"nodeId": 1, "port": "output"}, "to": {"nodeId": 2, "port": "input"}},
                {"id": 2, "from": {"nodeId": 2, "port": "output"}, "to": {"nodeId": 1, "port": "input"}}
            ]
        });

        let req = test::TestRequest::post()
            .uri("/api/validate")
            .set_json(&cyclic)
            .to_request();
        let report: serde_json::Value = test::call_and_read_body_json(&app, req).await;
        assert_eq!(report["isValid"], false);

        let req = test::TestRequest::post()
            .uri("/api/workflows")
            .set_json(json!({ "graph": cyclic }))
            .to_request();
        let created: serde_json::Value = test::call_and_read_body_json(&app, req).await;
        let id = created["id"].as_str().unwrap().to_string();

        let req = test::TestRequest::post()
            .uri(&format!("/api/workflows/{}/execute", id))
            .to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), StatusCode::UNPROCESSABLE_ENTITY);
        let body: serde_json::Value = test::read_body_json(resp).await;
        assert_eq!(body["issues"][0]["kind"], "cycle");

        let req = test::TestRequest::post()
            .uri("/api/validate")
            .set_json(json!({ "nodes": [{"id": 1, "type": "teleport"}] }))
            .to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    }

    #[actix_web::test]
    async fn test_bad_document_ids_are_rejected() {
        let app = test::init_service(App::new().app_data(state()).configure(configure)).await;

        let repeated = json!({
            "nodes": [
                {"id": 1, "type": "input"},
                {"id": 1, "type": "output"}
            ]
        });
        let req = test::TestRequest::post()
            .uri("/api/workflows")
            .set_json(json!({ "graph": repeated }))
            .to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);

        let req = test::TestRequest::post()
            .uri("/api/validate")
            .set_json(json!({ "nodes": [{"id": 0, "type": "input"}] }))
            .to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);

        let req = test::TestRequest::post()
            .uri("/api/validate")
            .set_json(json!({ "nodes": [{"id": u32::MAX, "type": "input"}] }))
            .to_request();
        let report: serde_json::Value = test::call_and_read_body_json(&app, req).await;
        assert_eq!(report["isValid"], true);
    }
}
