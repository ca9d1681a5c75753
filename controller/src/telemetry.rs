use actix_web::{get, http::header::CONTENT_TYPE, web::Data, HttpResponse};
use prometheus::{Encoder, Registry, TextEncoder};
use tracing::{event, Level};

#[get("/metrics")]
pub async fn vending_metrics(registry: Data<Registry>) -> HttpResponse {
    let encoder = TextEncoder::new();
    let metric_families = registry.gather();
    let mut buf = Vec::new();
    if let Err(err) = encoder.encode(&metric_families[..], &mut buf) {
        event!(Level::ERROR, "Unable to encode metrics: '{}'", err);
        return HttpResponse::InternalServerError().finish();
    }

    let body = String::from_utf8(buf).unwrap_or_default();
    HttpResponse::Ok()
        .insert_header((CONTENT_TYPE, prometheus::TEXT_FORMAT))
        .body(body)
}

#[cfg(test)]
mod tests {
    use super::*;
    use actix_web::{test, App};
    use prometheus::IntCounter;

    #[actix_web::test]
    async fn test_vending_metrics() {
        let registry = Registry::new();
        let counter = IntCounter::new("quarantine_test_total", "test counter").unwrap();
        registry.register(Box::new(counter.clone())).unwrap();
        counter.inc();

        let app = test::init_service(
            App::new()
                .app_data(Data::new(registry))
                .service(vending_metrics),
        )
        .await;
        let req = test::TestRequest::get().uri("/metrics").to_request();
        let body = test::call_and_read_body(&app, req).await;
        let body = String::from_utf8(body.to_vec()).unwrap();
        assert!(body.contains("quarantine_test_total 1"));
    }
}
