use caregraph::config::SupergraphConfig;
use caregraph::federation_gateway::FederationGateway;
use caregraph::identity::{Principal, Role, TokenAuthority};
use caregraph::server::{CorsPolicy, serve};
use caregraph::subgraph::provisioning::HttpProvisioner;
use caregraph::subgraph::store::{DocumentStore, InMemoryStore};
use caregraph::subgraph::{SubgraphEndpoint, SubgraphKind, patient, serve_subgraph, users};
use pretty_assertions::assert_eq;
use serde_json::{Value, json};
use serial_test::serial;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::net::TcpListener;
use tokio::sync::oneshot;

#[derive(Default)]
struct Options {
    /// Community is composed from its schema file but nothing listens.
    community_down: bool,
    /// The nurse provisioning peer points at a closed port.
    nurse_peer_down: bool,
}

// Everything runs in-process on ephemeral ports; dropping the fixture stops
// every accept loop.
struct TestFixture {
    gateway_url: String,
    client: reqwest::Client,
    authority: TokenAuthority,
    users: Arc<InMemoryStore<users::User>>,
    patients: Arc<InMemoryStore<patient::PatientData>>,
    _shutdown: Vec<oneshot::Sender<()>>,
}

async fn bind() -> (TcpListener, SocketAddr) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    (listener, addr)
}

/// An address nothing listens on.
async fn closed_addr() -> SocketAddr {
    let (_listener, addr) = bind().await;
    addr
}

fn config_yaml(
    users: SocketAddr,
    community: SocketAddr,
    patient: SocketAddr,
    nurse: SocketAddr,
    nurse_peer: SocketAddr,
    community_from_file: bool,
) -> String {
    let community_schema = if community_from_file {
        "\n    schema:\n      file: community.graphql"
    } else {
        ""
    };
    format!(
        r#"
gateway:
  listen: 127.0.0.1:0
  subgraph_timeout_ms: 2000
  cors_origins:
    - http://localhost:3000
identity:
  active_key: test
  keys:
    test: integration-secret
subgraphs:
  users:
    routing_url: http://{users}/graphql
  community:
    routing_url: http://{community}/graphql{community_schema}
  patient:
    routing_url: http://{patient}/graphql
  nurse:
    routing_url: http://{nurse}/graphql
provisioning:
  patient_url: http://{patient}/graphql
  nurse_url: http://{nurse_peer}/graphql
  timeout_ms: 2000
"#
    )
}

impl TestFixture {
    async fn setup(options: Options) -> Self {
        let (users_listener, users_addr) = bind().await;
        let (patient_listener, patient_addr) = bind().await;
        let (nurse_listener, nurse_addr) = bind().await;
        let (community_listener, community_addr) = if options.community_down {
            (None, closed_addr().await)
        } else {
            let (listener, addr) = bind().await;
            (Some(listener), addr)
        };
        let nurse_peer = if options.nurse_peer_down {
            closed_addr().await
        } else {
            nurse_addr
        };

        let config = SupergraphConfig::from_yaml(
            &config_yaml(
                users_addr,
                community_addr,
                patient_addr,
                nurse_addr,
                nurse_peer,
                options.community_down,
            ),
            concat!(env!("CARGO_MANIFEST_DIR"), "/schemas"),
        )
        .unwrap();
        let authority = config.identity.authority().unwrap();
        let mut shutdown = Vec::new();
        let mut stop = || {
            let (tx, rx) = oneshot::channel::<()>();
            shutdown.push(tx);
            async move {
                let _ = rx.await;
            }
        };

        let users_store = Arc::new(InMemoryStore::<users::User>::new());
        let provisioner = HttpProvisioner::new(
            authority.clone(),
            config.provisioning.clone(),
            config.identity.provisioning_token_ttl(),
        );
        let users_schema =
            users::build_schema(users_store.clone(), authority.clone(), Arc::new(provisioner));
        tokio::spawn(serve(
            users_listener,
            Arc::new(SubgraphEndpoint::new("users", users_schema)),
            authority.clone(),
            CorsPolicy::default(),
            stop(),
        ));

        let patient_store = Arc::new(InMemoryStore::<patient::PatientData>::new());
        let patient_schema = patient::build_schema(patient_store.clone());
        tokio::spawn(serve(
            patient_listener,
            Arc::new(SubgraphEndpoint::new("patient", patient_schema)),
            authority.clone(),
            CorsPolicy::default(),
            stop(),
        ));

        let subgraphs = [
            (SubgraphKind::Nurse, Some(nurse_listener)),
            (SubgraphKind::Community, community_listener),
        ];
        for (kind, listener) in subgraphs {
            let Some(listener) = listener else { continue };
            let (config, authority, stopped) = (config.clone(), authority.clone(), stop());
            tokio::spawn(async move {
                serve_subgraph(kind, listener, &config, authority, stopped).await
            });
        }

        let gateway = Arc::new(FederationGateway::with_timeout(
            config.gateway.subgraph_timeout(),
        ));
        gateway.load_schemas(&config).await.unwrap();
        let (gateway_listener, gateway_addr) = bind().await;
        tokio::spawn(serve(
            gateway_listener,
            gateway,
            authority.clone(),
            CorsPolicy::new(config.gateway.cors_origins.clone()),
            stop(),
        ));

        TestFixture {
            gateway_url: format!("http://{gateway_addr}/graphql"),
            client: reqwest::Client::new(),
            authority,
            users: users_store,
            patients: patient_store,
            _shutdown: shutdown,
        }
    }

    async fn execute(&self, query: &str, variables: Value, token: Option<&str>) -> Value {
        let mut request = self
            .client
            .post(&self.gateway_url)
            .json(&json!({ "query": query, "variables": variables }));
        if let Some(token) = token {
            request = request.bearer_auth(token);
        }
        request.send().await.unwrap().json().await.unwrap()
    }

    async fn signup(&self, user_name: &str, role: &str) -> Value {
        self.execute(
            "mutation($userName: String!, $email: String!, $role: String!) {
               signup(userName: $userName, email: $email, password: \"secret123\", role: $role) { id userName role }
             }",
            json!({
                "userName": user_name,
                "email": format!("{user_name}@example.com"),
                "role": role,
            }),
            None,
        )
        .await
    }

    async fn login(&self, user_name: &str, password: &str) -> Value {
        self.execute(
            "mutation($userName: String!, $password: String!) {
               login(userName: $userName, password: $password) { token user { id userName role } }
             }",
            json!({ "userName": user_name, "password": password }),
            None,
        )
        .await
    }

    async fn token_for(&self, user_name: &str) -> String {
        let result = self.login(user_name, "secret123").await;
        result["data"]["login"]["token"].as_str().unwrap().to_string()
    }
}

fn unix_now() -> u64 {
    SystemTime::now().duration_since(UNIX_EPOCH).unwrap().as_secs()
}

#[tokio::test]
#[serial]
async fn test_patient_signup_provisions_default_record() {
    let fixture = TestFixture::setup(Options::default()).await;

    let result = fixture.signup("pat", "PATIENT").await;
    assert_eq!(result.get("errors"), None);
    let user_id = result["data"]["signup"]["id"].as_str().unwrap().to_string();
    assert_eq!(result["data"]["signup"]["role"], json!("PATIENT"));
    assert_eq!(fixture.patients.writes(), 1);

    let token = fixture.token_for("pat").await;
    let record = fixture
        .execute(
            "query($userId: ID!) {
               patientDataByUserId(userId: $userId) {
                 user
                 dailyInfoRequired { pulseRate bloodPressure weight temperature respiratoryRate }
                 symptoms { fever dryCough }
                 emergencyAlerts { id }
               }
             }",
            json!({ "userId": user_id }),
            Some(&token),
        )
        .await;
    assert_eq!(
        record["data"]["patientDataByUserId"],
        json!({
            "user": user_id,
            "dailyInfoRequired": {
                "pulseRate": true,
                "bloodPressure": true,
                "weight": true,
                "temperature": true,
                "respiratoryRate": true,
            },
            "symptoms": { "fever": false, "dryCough": false },
            "emergencyAlerts": [],
        })
    );
}

#[tokio::test]
#[serial]
async fn test_login() {
    let fixture = TestFixture::setup(Options::default()).await;
    fixture.signup("ria", "RESIDENT").await;

    let result = fixture.login("ria", "secret123").await;
    let login = &result["data"]["login"];
    assert_eq!(login["user"]["userName"], json!("ria"));
    assert_eq!(login["user"]["role"], json!("RESIDENT"));
    let principal = fixture
        .authority
        .verify(login["token"].as_str().unwrap())
        .unwrap();
    assert_eq!(principal.id, login["user"]["id"].as_str().unwrap());
    assert_eq!(principal.role, Role::Resident);

    let result = fixture.login("ria", "wrong-password").await;
    assert_eq!(result, json!({ "data": { "login": null } }));
}

#[tokio::test]
#[serial]
async fn test_post_authors_resolve_across_subgraphs() {
    let fixture = TestFixture::setup(Options::default()).await;
    fixture.signup("ria", "RESIDENT").await;
    let token = fixture.token_for("ria").await;

    for title in ["Block party", "Road closure"] {
        let created = fixture
            .execute(
                "mutation($title: String!) {
                   createPost(title: $title, content: \"Details inside\", category: \"news\") { id }
                 }",
                json!({ "title": title }),
                Some(&token),
            )
            .await;
        assert_eq!(created.get("errors"), None);
    }

    let writes = fixture.users.writes();
    let result = fixture
        .execute("{ posts { title author { userName role } } }", json!({}), None)
        .await;
    assert_eq!(
        result,
        json!({
            "data": {
                "posts": [
                    { "title": "Block party", "author": { "userName": "ria", "role": "RESIDENT" } },
                    { "title": "Road closure", "author": { "userName": "ria", "role": "RESIDENT" } },
                ]
            }
        })
    );
    // Reference resolution only reads.
    assert_eq!(fixture.users.writes(), writes);
}

#[tokio::test]
#[serial]
async fn test_role_checks_are_forwarded() {
    let fixture = TestFixture::setup(Options::default()).await;
    fixture.signup("ria", "RESIDENT").await;
    let token = fixture.token_for("ria").await;

    let forbidden = fixture.execute("{ users { id } }", json!({}), Some(&token)).await;
    assert_eq!(forbidden["errors"][0]["extensions"]["code"], json!("FORBIDDEN"));
    assert_eq!(forbidden["errors"][0]["extensions"]["serviceName"], json!("users"));

    let anonymous = fixture.execute("{ users { id } }", json!({}), None).await;
    assert_eq!(anonymous["errors"][0]["extensions"]["code"], json!("UNAUTHENTICATED"));
}

#[tokio::test]
#[serial]
async fn test_expired_token_is_anonymous() {
    let fixture = TestFixture::setup(Options::default()).await;
    let now = unix_now();
    let expired = fixture
        .authority
        .issue(&Principal {
            id: "ghost".into(),
            user_name: "ghost".into(),
            role: Role::Resident,
            iat: now - 120,
            exp: now - 60,
        })
        .unwrap();

    let result = fixture
        .execute("{ isLoggedIn user { id } }", json!({}), Some(&expired))
        .await;
    assert_eq!(result, json!({ "data": { "isLoggedIn": false, "user": null } }));

    let result = fixture
        .execute(
            "mutation { createHelpRequest(description: \"Groceries\") { id } }",
            json!({}),
            Some(&expired),
        )
        .await;
    assert_eq!(result["errors"][0]["extensions"]["code"], json!("UNAUTHENTICATED"));
}

#[tokio::test]
#[serial]
async fn test_unreachable_subgraph_fails_only_its_fields() {
    let fixture = TestFixture::setup(Options {
        community_down: true,
        ..Options::default()
    })
    .await;

    let result = fixture
        .execute("{ isLoggedIn post(id: \"p1\") { id title } }", json!({}), None)
        .await;
    assert_eq!(result["data"], json!({ "isLoggedIn": false, "post": null }));
    let errors = result["errors"].as_array().unwrap();
    assert_eq!(errors.len(), 1);
    assert_eq!(errors[0]["path"], json!(["post"]));
    assert_eq!(errors[0]["extensions"]["code"], json!("SUBREQUEST_HTTP_ERROR"));
    assert_eq!(errors[0]["extensions"]["serviceName"], json!("community"));
}

#[tokio::test]
#[serial]
async fn test_failed_provisioning_keeps_the_user() {
    let fixture = TestFixture::setup(Options {
        nurse_peer_down: true,
        ..Options::default()
    })
    .await;

    let result = fixture.signup("nina", "NURSE").await;
    assert_eq!(result["data"], Value::Null);
    assert_eq!(result["errors"][0]["message"], json!("Failed to create nurse record"));
    assert_eq!(result["errors"][0]["extensions"]["code"], json!("PROVISIONING_FAILED"));

    let stored = fixture
        .users
        .find_one(&|u: &users::User| u.user_name == "nina")
        .await
        .unwrap();
    assert!(stored.is_some());
    let login = fixture.login("nina", "secret123").await;
    assert_eq!(login["data"]["login"]["user"]["role"], json!("NURSE"));
}

#[tokio::test]
#[serial]
async fn test_health_and_cors() {
    let fixture = TestFixture::setup(Options::default()).await;
    let health_url = fixture.gateway_url.replace("/graphql", "/health");

    let health: Value = fixture
        .client
        .get(&health_url)
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(health, json!({ "status": "ok" }));

    let preflight = fixture
        .client
        .request(reqwest::Method::OPTIONS, &fixture.gateway_url)
        .header("Origin", "http://localhost:3000")
        .send()
        .await
        .unwrap();
    assert_eq!(preflight.status(), reqwest::StatusCode::NO_CONTENT);
    assert_eq!(
        preflight.headers()["access-control-allow-origin"],
        "http://localhost:3000"
    );
}
