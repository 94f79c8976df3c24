//! Gateway API inner router
//!
//! Splits traffic through the first rule of an HTTPRoute with two weighted
//! backends, `<target>-primary` and `<target>-canary`. A missing HTTPRoute is
//! not an error: routing is optional and reads back as all-primary.

use super::{MeshRouter, RouteWeights, RouterError};
use crate::crd::canary::Canary;
use async_trait::async_trait;
use gateway_api::apis::standard::httproutes::HTTPRouteRulesBackendRefs;
use kube::api::{Api, Patch, PatchParams};
use kube::core::DynamicObject;
use kube::discovery::ApiResource;
use kube::{Client, ResourceExt};
use serde_json::{json, Value};
use tracing::{debug, error, info, warn};

/// Gateway API filter type used for traffic shadowing
const REQUEST_MIRROR: &str = "RequestMirror";

fn httproute_resource() -> ApiResource {
    ApiResource {
        group: "gateway.networking.k8s.io".to_string(),
        version: "v1".to_string(),
        api_version: "gateway.networking.k8s.io/v1".to_string(),
        kind: "HTTPRoute".to_string(),
        plural: "httproutes".to_string(),
    }
}

/// Name of the HTTPRoute carrying the split, `service.httpRoute` or the target name
pub fn route_name(canary: &Canary) -> String {
    canary
        .spec
        .service
        .http_route
        .clone()
        .unwrap_or_else(|| canary.spec.target_ref.name.clone())
}

/// Weighted primary and canary backends on the service port
pub fn build_backend_refs(
    canary: &Canary,
    primary_weight: i32,
    canary_weight: i32,
) -> Vec<HTTPRouteRulesBackendRefs> {
    let (_, primary, canary_svc) = canary.service_names();
    let port = canary.spec.service.port;
    [(primary, primary_weight), (canary_svc, canary_weight)]
        .into_iter()
        .map(|(name, weight)| HTTPRouteRulesBackendRefs {
            name,
            port: Some(port),
            weight: Some(weight),
            kind: Some("Service".to_string()),
            group: Some("".to_string()),
            namespace: None,
            filters: None,
        })
        .collect()
}

/// Merge patch setting the weighted backends on the first rule of `route`.
///
/// Works on a copy of the fetched rules: matches, other filters and further
/// rules are kept. A RequestMirror filter shadowing requests to the canary
/// service is present exactly when `mirrored`. The fetched resourceVersion
/// guards against concurrent edits of the route.
pub fn route_patch(
    canary: &Canary,
    route: &DynamicObject,
    primary_weight: i32,
    canary_weight: i32,
    mirrored: bool,
) -> Value {
    let mut rules = route
        .data
        .pointer("/spec/rules")
        .and_then(Value::as_array)
        .cloned()
        .unwrap_or_default();
    if rules.is_empty() {
        rules.push(json!({}));
    }
    if !rules[0].is_object() {
        rules[0] = json!({});
    }

    let backend_refs = build_backend_refs(canary, primary_weight, canary_weight);
    let (_, _, canary_svc) = canary.service_names();
    let rule = &mut rules[0];
    rule["backendRefs"] = json!(backend_refs);

    let mut filters: Vec<Value> = rule
        .get("filters")
        .and_then(Value::as_array)
        .map(|filters| {
            filters
                .iter()
                .filter(|f| f.get("type").and_then(Value::as_str) != Some(REQUEST_MIRROR))
                .cloned()
                .collect()
        })
        .unwrap_or_default();
    if mirrored {
        filters.push(json!({
            "type": REQUEST_MIRROR,
            "requestMirror": {
                "backendRef": {
                    "name": canary_svc,
                    "port": canary.spec.service.port
                }
            }
        }));
    }
    if let Some(rule) = rule.as_object_mut() {
        if filters.is_empty() {
            rule.remove("filters");
        } else {
            rule.insert("filters".to_string(), Value::Array(filters));
        }
    }

    json!({
        "metadata": { "resourceVersion": route.metadata.resource_version },
        "spec": { "rules": rules }
    })
}

/// Read the split back from an HTTPRoute.
///
/// Backends without an explicit weight count as 1, the Gateway API default.
/// A route that routes to neither backend reads as all-primary.
pub fn weights_from_route(route: &Value, primary: &str, canary: &str) -> RouteWeights {
    let Some(rule) = route.pointer("/spec/rules/0") else {
        return RouteWeights::PRIMARY_ONLY;
    };

    let weight_of = |name: &str| -> Option<i32> {
        rule.get("backendRefs")?
            .as_array()?
            .iter()
            .find(|b| b.get("name").and_then(Value::as_str) == Some(name))
            .map(|b| {
                b.get("weight")
                    .and_then(Value::as_i64)
                    .map(|w| w as i32)
                    .unwrap_or(1)
            })
    };

    let (primary_weight, canary_weight) = match (weight_of(primary), weight_of(canary)) {
        (None, None) => return RouteWeights::PRIMARY_ONLY,
        (p, c) => (p.unwrap_or(0), c.unwrap_or(0)),
    };

    let mirrored = rule
        .get("filters")
        .and_then(Value::as_array)
        .map(|filters| {
            filters
                .iter()
                .any(|f| f.get("type").and_then(Value::as_str) == Some(REQUEST_MIRROR))
        })
        .unwrap_or(false);

    RouteWeights {
        primary: primary_weight,
        canary: canary_weight,
        mirrored,
    }
}

pub struct GatewayApiRouter {
    client: Client,
}

impl GatewayApiRouter {
    pub fn new(client: Client) -> Self {
        GatewayApiRouter { client }
    }

    fn api(&self, canary: &Canary) -> Result<Api<DynamicObject>, RouterError> {
        let namespace = canary.target_namespace().ok_or_else(|| RouterError::Route {
            name: route_name(canary),
            namespace: String::new(),
            primary_weight: 0,
            canary_weight: 0,
            message: "canary has no namespace".to_string(),
        })?;
        Ok(Api::namespaced_with(
            self.client.clone(),
            &namespace,
            &httproute_resource(),
        ))
    }

    async fn fetch(&self, canary: &Canary) -> Result<Option<DynamicObject>, RouterError> {
        let api = self.api(canary)?;
        match api.get_opt(&route_name(canary)).await {
            Ok(route) => Ok(route),
            Err(e) => {
                error!(
                    error = ?e,
                    canary = ?canary.name_any(),
                    httproute = ?route_name(canary),
                    "Failed to read HTTPRoute"
                );
                Err(RouterError::KubeError(e))
            }
        }
    }
}

#[async_trait]
impl MeshRouter for GatewayApiRouter {
    /// Seed the route with an all-primary split unless it already routes to
    /// the primary or canary backend
    async fn reconcile(&self, canary: &Canary) -> Result<(), RouterError> {
        let Some(route) = self.fetch(canary).await? else {
            warn!(
                canary = ?canary.name_any(),
                httproute = ?route_name(canary),
                "HTTPRoute not found - skipping traffic routing setup"
            );
            return Ok(());
        };

        let (_, primary, canary_svc) = canary.service_names();
        let routed = route
            .data
            .pointer("/spec/rules/0/backendRefs")
            .and_then(Value::as_array)
            .map(|refs| {
                refs.iter().any(|b| {
                    let name = b.get("name").and_then(Value::as_str);
                    name == Some(primary.as_str()) || name == Some(canary_svc.as_str())
                })
            })
            .unwrap_or(false);
        if routed {
            debug!(canary = ?canary.name_any(), "HTTPRoute already routes to canary backends");
            return Ok(());
        }

        self.set_routes(canary, 100, 0, false).await
    }

    async fn set_routes(
        &self,
        canary: &Canary,
        primary_weight: i32,
        canary_weight: i32,
        mirrored: bool,
    ) -> Result<(), RouterError> {
        let name = route_name(canary);
        let api = self.api(canary)?;
        let Some(route) = self.fetch(canary).await? else {
            warn!(
                canary = ?canary.name_any(),
                httproute = ?name,
                "HTTPRoute not found - skipping traffic routing update"
            );
            return Ok(());
        };
        let patch = route_patch(canary, &route, primary_weight, canary_weight, mirrored);

        info!(
            canary = ?canary.name_any(),
            httproute = ?name,
            primary_weight = primary_weight,
            canary_weight = canary_weight,
            mirrored = mirrored,
            "Updating HTTPRoute with weighted backends"
        );

        match api
            .patch(&name, &PatchParams::default(), &Patch::Merge(&patch))
            .await
        {
            Ok(_) => Ok(()),
            Err(kube::Error::Api(err)) if err.code == 404 => {
                warn!(
                    canary = ?canary.name_any(),
                    httproute = ?name,
                    "HTTPRoute not found - skipping traffic routing update"
                );
                Ok(())
            }
            Err(e) => {
                error!(
                    error = ?e,
                    canary = ?canary.name_any(),
                    httproute = ?name,
                    "Failed to patch HTTPRoute"
                );
                Err(RouterError::Route {
                    name,
                    namespace: canary.target_namespace().unwrap_or_default(),
                    primary_weight,
                    canary_weight,
                    message: e.to_string(),
                })
            }
        }
    }

    async fn get_routes(&self, canary: &Canary) -> Result<RouteWeights, RouterError> {
        let (_, primary, canary_svc) = canary.service_names();
        Ok(match self.fetch(canary).await? {
            Some(route) => weights_from_route(&route.data, &primary, &canary_svc),
            None => RouteWeights::PRIMARY_ONLY,
        })
    }

    /// The HTTPRoute is user owned and left in place
    async fn finalize(&self, _canary: &Canary) -> Result<(), RouterError> {
        Ok(())
    }
}
