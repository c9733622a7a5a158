use std::sync::Arc;
use std::time::Duration;

use httptest::matchers::{all_of, contains, request, url_decoded};
use httptest::responders::{cycle, json_encoded, status_code};
use httptest::{Expectation, Server};
use secrecy::SecretString;
use serde_json::json;

use geo_enrich::geocode::{
    GeocodeError, GeocodeQuery, GeocodeService, GeocodeSettings, Geocoder, GoogleGeocoder,
    Resolution,
};
use geo_enrich::model::Coordinates;
use geo_enrich::AddressKey;

const PATH: &str = "/maps/api/geocode/json";

fn geocoder(server: &Server) -> GoogleGeocoder {
    GoogleGeocoder::new(
        SecretString::from("test-key".to_string()),
        server.url_str(PATH),
        Duration::from_secs(2),
    )
    .unwrap()
}

fn query(text: &str) -> GeocodeQuery {
    GeocodeQuery {
        text: text.into(),
        region: Some("de".into()),
        language: None,
    }
}

fn ok_body(lat: f64, lng: f64) -> serde_json::Value {
    json!({
        "status": "OK",
        "results": [{
            "formatted_address": "Marienplatz, 80331 München, Germany",
            "geometry": { "location": { "lat": lat, "lng": lng } },
            "place_id": "ignored"
        }]
    })
}

fn fast_settings() -> GeocodeSettings {
    GeocodeSettings {
        country_hint: Some("Germany".into()),
        region: Some("de".into()),
        language: None,
        timeout: Duration::from_secs(2),
        max_attempts: 3,
        rate_limit_qps: 1000,
        backoff_base: Duration::from_millis(1),
    }
}

#[tokio::test]
async fn sends_address_key_and_region_and_reads_first_candidate() {
    let server = Server::run();
    server.expect(
        Expectation::matching(all_of![
            request::method("GET"),
            request::path(PATH),
            request::query(url_decoded(contains(("address", "marienplatz, munich, Germany")))),
            request::query(url_decoded(contains(("key", "test-key")))),
            request::query(url_decoded(contains(("region", "de"))))
        ])
        .respond_with(json_encoded(ok_body(48.1374, 11.5755))),
    );

    let candidates = geocoder(&server)
        .geocode(&query("marienplatz, munich, Germany"))
        .await
        .unwrap();
    assert_eq!(candidates.len(), 1);
    assert_eq!(
        candidates[0].coordinates,
        Coordinates {
            lat: 48.1374,
            lng: 11.5755
        }
    );
    assert!(candidates[0].formatted_address.is_some());
}

#[tokio::test]
async fn maps_provider_statuses_to_failures() {
    let server = Server::run();
    server.expect(
        Expectation::matching(request::method_path("GET", PATH))
            .times(4)
            .respond_with(cycle![
                json_encoded(json!({ "status": "ZERO_RESULTS", "results": [] })),
                json_encoded(json!({ "status": "REQUEST_DENIED", "error_message": "bad key" })),
                json_encoded(json!({ "status": "INVALID_REQUEST" })),
                json_encoded(json!({ "status": "OVER_QUERY_LIMIT" }))
            ]),
    );

    let geocoder = geocoder(&server);
    assert!(geocoder.geocode(&query("a")).await.unwrap().is_empty());
    assert_eq!(
        geocoder.geocode(&query("a")).await.unwrap_err(),
        GeocodeError::Unauthorized("bad key".into())
    );
    assert!(matches!(
        geocoder.geocode(&query("a")).await.unwrap_err(),
        GeocodeError::InvalidRequest(_)
    ));
    assert_eq!(
        geocoder.geocode(&query("a")).await.unwrap_err(),
        GeocodeError::RateLimited
    );
}

#[tokio::test]
async fn maps_http_statuses_to_failures() {
    let server = Server::run();
    server.expect(
        Expectation::matching(request::method_path("GET", PATH))
            .times(3)
            .respond_with(cycle![
                status_code(429),
                status_code(403),
                status_code(503)
            ]),
    );

    let geocoder = geocoder(&server);
    assert_eq!(
        geocoder.geocode(&query("a")).await.unwrap_err(),
        GeocodeError::RateLimited
    );
    assert!(matches!(
        geocoder.geocode(&query("a")).await.unwrap_err(),
        GeocodeError::Unauthorized(_)
    ));
    let unavailable = geocoder.geocode(&query("a")).await.unwrap_err();
    assert!(matches!(unavailable, GeocodeError::Unavailable(_)));
    assert!(unavailable.is_transient());
}

#[tokio::test]
async fn service_retries_rate_limits_through_http() {
    let server = Server::run();
    server.expect(
        Expectation::matching(request::method_path("GET", PATH))
            .times(2)
            .respond_with(cycle![
                json_encoded(json!({ "status": "OVER_QUERY_LIMIT" })),
                json_encoded(ok_body(48.1374, 11.5755))
            ]),
    );

    let service = GeocodeService::with_geocoder(Arc::new(geocoder(&server)), fast_settings());
    let resolution = service
        .resolve(&AddressKey::normalize("Marienplatz, Munich"))
        .await;
    assert_eq!(
        resolution,
        Resolution::Resolved {
            coordinates: Coordinates {
                lat: 48.1374,
                lng: 11.5755
            },
            attempts: 2
        }
    );
}

#[tokio::test]
async fn service_treats_zero_results_as_terminal() {
    let server = Server::run();
    server.expect(
        Expectation::matching(request::method_path("GET", PATH))
            .times(1)
            .respond_with(json_encoded(json!({ "status": "ZERO_RESULTS", "results": [] }))),
    );

    let service = GeocodeService::with_geocoder(Arc::new(geocoder(&server)), fast_settings());
    let resolution = service.resolve(&AddressKey::normalize("Nowhere 1")).await;
    assert_eq!(
        resolution,
        Resolution::Failed {
            error: GeocodeError::NoResults,
            attempts: 1
        }
    );
}
