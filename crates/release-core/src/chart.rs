use chrono::Utc;
use serde::Serialize;

use shared::{
    models::{AppProbes, AppRef, EnvVariableMap},
    utilities::{errors::AppError, names},
};

/// One rendered environment assignment.
#[derive(Serialize, Clone, Debug, PartialEq, Eq)]
pub struct EnvParam {
    pub name: String,
    pub value: String,
}

/// One desired route, split into the pieces the chart templates need.
#[derive(Serialize, Clone, Debug, PartialEq, Eq)]
pub struct RouteParam {
    pub id: String,
    pub domain: String,
    pub path: String,
}

#[derive(Serialize, Clone, Debug)]
#[serde(rename_all = "camelCase")]
pub struct IngressParam {
    pub class_name: String,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct AppParam {
    app_name: String,
    namespace: String,
    configurations: Vec<String>,
    env: Vec<EnvParam>,
    image_url: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    ingress: Option<IngressParam>,
    #[serde(skip_serializing_if = "Option::is_none")]
    liveness_probe: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    readiness_probe: Option<serde_json::Value>,
    replica_count: i32,
    routes: Vec<RouteParam>,
    stage_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    start: Option<String>,
    tls_issuer: String,
}

#[derive(Serialize)]
struct ChartValues {
    stratus: AppParam,
}

/// Everything the deployment chart is parameterized on.
#[derive(Clone, Debug)]
pub struct ChartInput {
    pub app: AppRef,
    pub image_url: String,
    pub instances: i32,
    pub probes: AppProbes,
    pub environment: EnvVariableMap,
    pub configurations: Vec<String>,
    pub services: Vec<String>,
    pub routes: Vec<String>,
    pub ingress_class_name: Option<String>,
    pub tls_issuer: String,
    pub stage_id: String,
    pub start: Option<String>,
}

/// The value a deploy's `start` field gets when the caller asks for a
/// forced restart. It is the one input allowed to differ between
/// otherwise identical renders.
pub fn restart_nonce() -> String {
    Utc::now()
        .timestamp_nanos_opt()
        .unwrap_or_default()
        .to_string()
}

fn route_param(route: &str) -> RouteParam {
    let (domain, path) = match route.split_once('/') {
        Some((domain, rest)) => (domain.to_string(), format!("/{rest}")),
        None => (route.to_string(), "/".to_string()),
    };

    RouteParam {
        id: names::generate_resource_name(&[route]),
        domain,
        path,
    }
}

/// Renders the chart values document. Collections are sorted and
/// deduplicated so identical desired state always yields a
/// byte-identical document.
pub fn render(input: &ChartInput) -> Result<String, AppError> {
    let mut configurations: Vec<String> = input
        .configurations
        .iter()
        .cloned()
        .chain(
            input
                .services
                .iter()
                .map(|name| names::service_binding_resource(name)),
        )
        .collect();
    configurations.sort();
    configurations.dedup();

    let env: Vec<EnvParam> = input
        .environment
        .iter()
        .map(|(name, value)| EnvParam {
            name: name.clone(),
            value: value.clone(),
        })
        .collect();

    let routes: Vec<RouteParam> = input.routes.iter().map(|r| route_param(r)).collect();

    let values = ChartValues {
        stratus: AppParam {
            app_name: input.app.name.clone(),
            namespace: input.app.namespace.clone(),
            configurations,
            env,
            image_url: input.image_url.clone(),
            ingress: input
                .ingress_class_name
                .as_ref()
                .map(|class_name| IngressParam {
                    class_name: class_name.clone(),
                }),
            liveness_probe: input.probes.liveness.clone(),
            readiness_probe: input.probes.readiness.clone(),
            replica_count: input.instances,
            routes,
            stage_id: input.stage_id.clone(),
            start: input.start.clone(),
            tls_issuer: input.tls_issuer.clone(),
        },
    };

    Ok(serde_yaml::to_string(&values)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn input() -> ChartInput {
        ChartInput {
            app: AppRef::new("myapp", "workspace"),
            image_url: "registry.local:5000/apps/workspace-myapp:ffff".to_string(),
            instances: 2,
            probes: AppProbes::default(),
            environment: EnvVariableMap::from([
                ("PORT".to_string(), "8080".to_string()),
                ("MODE".to_string(), "prod".to_string()),
            ]),
            configurations: vec!["db-creds".to_string()],
            services: vec!["mydb".to_string()],
            routes: vec!["myapp.example.com".to_string()],
            ingress_class_name: None,
            tls_issuer: "stratus-ca".to_string(),
            stage_id: "ffff".to_string(),
            start: None,
        }
    }

    #[test]
    fn test_render_is_deterministic() {
        let a = render(&input()).unwrap();
        let b = render(&input()).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_render_merges_and_sorts_bindings() {
        let mut i = input();
        i.configurations = vec![
            "zzz".to_string(),
            "db-creds".to_string(),
            "db-creds".to_string(),
        ];
        i.services = vec!["mydb".to_string()];
        let doc = render(&i).unwrap();

        let s_mydb = names::service_binding_resource("mydb");
        let configs_pos = doc.find("configurations:").unwrap();
        let db_pos = doc.find("db-creds").unwrap();
        let svc_pos = doc.find(&s_mydb).unwrap();
        let zzz_pos = doc.find("zzz").unwrap();
        assert!(configs_pos < db_pos && db_pos < svc_pos && svc_pos < zzz_pos);
        assert_eq!(doc.matches("db-creds").count(), 1);
    }

    #[test]
    fn test_render_env_sorted_by_name() {
        let doc = render(&input()).unwrap();
        let mode = doc.find("MODE").unwrap();
        let port = doc.find("PORT").unwrap();
        assert!(mode < port);
    }

    #[test]
    fn test_render_route_split() {
        let mut i = input();
        i.routes = vec!["myapp.example.com/api/v2".to_string()];
        let doc = render(&i).unwrap();
        assert!(doc.contains("domain: myapp.example.com"));
        assert!(doc.contains("path: /api/v2"));
    }

    #[test]
    fn test_render_route_without_path_defaults_to_root() {
        let doc = render(&input()).unwrap();
        assert!(doc.contains("domain: myapp.example.com"));
        assert!(doc.contains("path: /"));
    }

    #[test]
    fn test_render_omits_absent_optionals() {
        let doc = render(&input()).unwrap();
        assert!(!doc.contains("start:"));
        assert!(!doc.contains("ingress:"));

        let mut i = input();
        i.ingress_class_name = Some("traefik".to_string());
        i.start = Some("12345".to_string());
        let doc = render(&i).unwrap();
        assert!(doc.contains("start: '12345'"));
        assert!(doc.contains("className: traefik"));
    }

    #[test]
    fn test_render_probes_only_when_stored() {
        let doc = render(&input()).unwrap();
        assert!(!doc.contains("livenessProbe:"));
        assert!(!doc.contains("readinessProbe:"));

        let mut i = input();
        i.probes.liveness = Some(serde_json::json!({
            "httpGet": { "path": "/health", "port": 8080 }
        }));
        let doc = render(&i).unwrap();
        assert!(doc.contains("livenessProbe:"));
        assert!(doc.contains("path: /health"));
        assert!(!doc.contains("readinessProbe:"));
    }

    #[test]
    fn test_render_start_nonce_is_the_only_difference() {
        let mut with_nonce = input();
        with_nonce.start = Some("99".to_string());
        let a = render(&input()).unwrap();
        let b = render(&with_nonce).unwrap();
        assert_ne!(a, b);

        let scrubbed: String = b.lines().filter(|l| !l.contains("start:")).collect();
        let base: String = a.lines().collect();
        assert_eq!(scrubbed, base);
    }
}
