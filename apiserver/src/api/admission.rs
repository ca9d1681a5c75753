use super::APIServerSettings;
use models::node::ClusterClient;
use models::quarantine::Quarantine;

use actix_web::{web, HttpResponse, Responder};
use kube::core::admission::{AdmissionRequest, AdmissionResponse, AdmissionReview};
use tracing::{event, Level};

/// Decodes an AdmissionReview for a Quarantine. A review that cannot be decoded yields the `invalid` response
/// to send back instead.
fn parse_review(
    body: serde_json::Value,
) -> std::result::Result<AdmissionRequest<Quarantine>, AdmissionResponse> {
    let review: AdmissionReview<Quarantine> = serde_json::from_value(body).map_err(|err| {
        event!(Level::WARN, %err, "Unable to decode AdmissionReview");
        AdmissionResponse::invalid(err)
    })?;
    review.try_into().map_err(|err| {
        event!(Level::WARN, %err, "AdmissionReview carries no usable request");
        AdmissionResponse::invalid(err)
    })
}

/// HTTP endpoint for the validating webhook.
pub(crate) async fn validate<T: ClusterClient + 'static>(
    settings: web::Data<APIServerSettings<T>>,
    body: web::Json<serde_json::Value>,
) -> impl Responder {
    let response = match parse_review(body.into_inner()) {
        Ok(request) => settings.guard.review(&request).await,
        Err(invalid) => invalid,
    };
    HttpResponse::Ok().json(response.into_review())
}

/// HTTP endpoint for the mutating webhook.
pub(crate) async fn mutate<T: ClusterClient + 'static>(
    settings: web::Data<APIServerSettings<T>>,
    body: web::Json<serde_json::Value>,
) -> impl Responder {
    let response = match parse_review(body.into_inner()) {
        Ok(request) => settings.guard.mutate(&request),
        Err(invalid) => invalid,
    };
    HttpResponse::Ok().json(response.into_review())
}

#[cfg(test)]
mod tests {
    use super::super::tests::test_settings;
    use super::*;
    use models::constants::{APISERVER_MUTATE_ROUTE, APISERVER_VALIDATE_ROUTE};
    use models::controller::controller_selector;
    use models::node::MockClusterClient;

    use actix_web::{test, web::Data, App};
    use k8s_openapi::api::core::v1::{Pod, PodSpec};
    use kube::api::ObjectMeta;
    use serde_json::{json, Value};
    use std::sync::Arc;

    fn quarantine_json(nodes: &[&str]) -> Value {
        json!({
            "apiVersion": "nodequarantine.io/v1alpha1",
            "kind": "Quarantine",
            "metadata": { "name": "maintenance", "namespace": "default" },
            "spec": {
                "nodes": nodes.iter().map(|name| json!({ "name": name })).collect::<Vec<_>>(),
            },
        })
    }

    fn review(operation: &str, object: Option<Value>, old_object: Option<Value>) -> Value {
        json!({
            "apiVersion": "admission.k8s.io/v1",
            "kind": "AdmissionReview",
            "request": {
                "uid": "705ab4f5-6393-11e8-b7cc-42010a800002",
                "kind": { "group": "nodequarantine.io", "version": "v1alpha1", "kind": "Quarantine" },
                "resource": { "group": "nodequarantine.io", "version": "v1alpha1", "resource": "quarantines" },
                "name": "maintenance",
                "namespace": "default",
                "operation": operation,
                "userInfo": { "username": "admin" },
                "object": object,
                "oldObject": old_object,
                "dryRun": false,
            },
        })
    }

    fn controller_on(node_name: &'static str) -> impl FnOnce(&mut MockClusterClient) {
        move |client: &mut MockClusterClient| {
            client.expect_list_pods().times(1).returning(move |_| {
                Ok(vec![Pod {
                    metadata: ObjectMeta {
                        name: Some("controller-a".to_string()),
                        labels: Some(controller_selector()),
                        ..Default::default()
                    },
                    spec: Some(PodSpec {
                        node_name: Some(node_name.to_string()),
                        ..Default::default()
                    }),
                    ..Default::default()
                }])
            });
        }
    }

    async fn call(
        settings: APIServerSettings<Arc<MockClusterClient>>,
        route: &str,
        body: Value,
    ) -> Value {
        let app = test::init_service(
            App::new()
                .route(
                    APISERVER_VALIDATE_ROUTE,
                    web::post().to(validate::<Arc<MockClusterClient>>),
                )
                .route(
                    APISERVER_MUTATE_ROUTE,
                    web::post().to(mutate::<Arc<MockClusterClient>>),
                )
                .app_data(Data::new(settings)),
        )
        .await;
        let req = test::TestRequest::post()
            .uri(route)
            .set_json(&body)
            .to_request();
        test::call_and_read_body_json(&app, req).await
    }

    #[actix_web::test]
    async fn test_create_on_controller_node_is_denied() {
        let settings = test_settings(controller_on("worker2"));
        let body = review("CREATE", Some(quarantine_json(&["worker1", "worker2"])), None);

        let resp = call(settings, APISERVER_VALIDATE_ROUTE, body).await;
        assert_eq!(resp["response"]["uid"], "705ab4f5-6393-11e8-b7cc-42010a800002");
        assert_eq!(resp["response"]["allowed"], false);
        let message = resp["response"]["status"]["message"].as_str().unwrap();
        assert!(message.contains("worker2"));
    }

    #[actix_web::test]
    async fn test_create_elsewhere_is_allowed() {
        let settings = test_settings(controller_on("worker3"));
        let body = review("CREATE", Some(quarantine_json(&["worker1"])), None);

        let resp = call(settings, APISERVER_VALIDATE_ROUTE, body).await;
        assert_eq!(resp["response"]["allowed"], true);
    }

    #[actix_web::test]
    async fn test_update_and_delete_pass_through() {
        let settings = test_settings(|client| {
            client.expect_list_pods().never();
        });
        let body = review(
            "UPDATE",
            Some(quarantine_json(&["worker2"])),
            Some(quarantine_json(&["worker1"])),
        );
        let resp = call(settings, APISERVER_VALIDATE_ROUTE, body).await;
        assert_eq!(resp["response"]["allowed"], true);

        let settings = test_settings(|client| {
            client.expect_list_pods().never();
        });
        let body = review("DELETE", None, Some(quarantine_json(&["worker1"])));
        let resp = call(settings, APISERVER_VALIDATE_ROUTE, body).await;
        assert_eq!(resp["response"]["allowed"], true);
    }

    #[actix_web::test]
    async fn test_mutate_allows_without_patch() {
        let settings = test_settings(|client| {
            client.expect_list_pods().never();
        });
        let body = review("CREATE", Some(quarantine_json(&["worker1"])), None);
        let resp = call(settings, APISERVER_MUTATE_ROUTE, body).await;
        assert_eq!(resp["response"]["allowed"], true);
        assert!(resp["response"].get("patch").map_or(true, Value::is_null));
    }

    #[actix_web::test]
    async fn test_malformed_review_is_invalid() {
        let settings = test_settings(|client| {
            client.expect_list_pods().never();
        });
        let body = json!({ "apiVersion": "admission.k8s.io/v1", "kind": "AdmissionReview" });
        let resp = call(settings, APISERVER_VALIDATE_ROUTE, body).await;
        assert_eq!(resp["response"]["allowed"], false);
    }
}
