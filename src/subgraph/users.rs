//! Accounts and login. Owns the `User` entity.

use async_graphql::{Context, EmptySubscription, ID, Object, Result, Schema, SimpleObject};
use std::sync::Arc;
use tracing::{debug, error, info};

use crate::identity::{Role, TokenAuthority, hash_password, verify_password};
use crate::subgraph::guard::{self, bad_input, internal};
use crate::subgraph::provisioning::{NewAccount, Provisioner};
use crate::subgraph::store::{Document, DocumentStore, new_id, timestamp};

pub type UsersSchema = Schema<Query, Mutation, EmptySubscription>;
pub type UserStore = Arc<dyn DocumentStore<User>>;

const MIN_PASSWORD_LEN: usize = 6;

#[derive(SimpleObject, Clone, Debug)]
pub struct User {
    pub id: ID,
    pub user_name: String,
    pub email: String,
    pub role: Role,
    #[graphql(skip)]
    pub password_hash: String,
    #[graphql(skip)]
    pub created_at: String,
}

impl Document for User {
    fn id(&self) -> &str {
        &self.id
    }
}

#[derive(SimpleObject)]
pub struct AuthPayload {
    pub token: Option<String>,
    pub user: Option<User>,
}

pub fn build_schema(
    store: UserStore,
    authority: TokenAuthority,
    provisioner: Arc<dyn Provisioner>,
) -> UsersSchema {
    Schema::build(Query, Mutation, EmptySubscription)
        .data(store)
        .data(authority)
        .data(provisioner)
        .enable_federation()
        .finish()
}

fn store<'a>(ctx: &'a Context<'_>) -> Result<&'a UserStore> {
    ctx.data::<UserStore>()
}

// `.+@.+\..+`
fn is_valid_email(email: &str) -> bool {
    let Some((local, domain)) = email.split_once('@') else {
        return false;
    };
    !local.is_empty()
        && domain
            .char_indices()
            .any(|(i, c)| c == '.' && i > 0 && i + 1 < domain.len())
}

pub struct Query;

#[Object]
impl Query {
    async fn is_logged_in(&self, ctx: &Context<'_>) -> bool {
        guard::identity(ctx).is_some()
    }

    /// The caller's own account.
    async fn user(&self, ctx: &Context<'_>) -> Result<Option<User>> {
        let Some(principal) = guard::identity(ctx) else {
            return Ok(None);
        };
        store(ctx)?.get(&principal.id).await.map_err(internal)
    }

    async fn users(&self, ctx: &Context<'_>) -> Result<Vec<User>> {
        guard::authorized(ctx, &[Role::CommunityOrganizer], "Not authorized to list users")?;
        store(ctx)?.find(&|_| true).await.map_err(internal)
    }

    #[graphql(entity)]
    async fn find_user_by_id(&self, ctx: &Context<'_>, id: ID) -> Result<Option<User>> {
        debug!(user = id.as_str(), "resolving user reference");
        store(ctx)?.get(&id).await.map_err(internal)
    }
}

pub struct Mutation;

#[Object]
impl Mutation {
    async fn signup(
        &self,
        ctx: &Context<'_>,
        user_name: String,
        email: String,
        password: String,
        role: String,
    ) -> Result<User> {
        let role: Role = role.parse().map_err(bad_input)?;
        let user_name = user_name.trim().to_string();
        let email = email.trim().to_string();
        if user_name.is_empty() {
            return Err(bad_input("Username is required"));
        }
        if !is_valid_email(&email) {
            return Err(bad_input("Please fill a valid email address"));
        }
        if password.len() < MIN_PASSWORD_LEN {
            return Err(bad_input("Password must be at least 6 characters."));
        }

        let store = store(ctx)?;
        let taken = store
            .find_one(&|u: &User| u.email == email)
            .await
            .map_err(internal)?;
        if taken.is_some() {
            return Err(bad_input("Email already exists"));
        }

        let user = store
            .create(User {
                id: ID(new_id()),
                user_name,
                email,
                role,
                password_hash: hash_password(&password).map_err(internal)?,
                created_at: timestamp(),
            })
            .await
            .map_err(internal)?;
        info!(user = user.id.as_str(), %role, "user created");

        let account = NewAccount {
            id: user.id.to_string(),
            user_name: user.user_name.clone(),
            role,
        };
        if let Some(message) = account.failure_message() {
            let provisioner = ctx.data::<Arc<dyn Provisioner>>()?;
            if let Err(e) = provisioner.provision(&account).await {
                // The user stays persisted; re-running provisioning is safe.
                error!(user = %account.id, %role, error = %e, "role record provisioning failed; user needs reconciliation");
                return Err(guard::provisioning_failed(message));
            }
        }

        Ok(user)
    }

    /// `null` on unknown user or wrong password.
    async fn login(
        &self,
        ctx: &Context<'_>,
        user_name: String,
        password: String,
    ) -> Result<Option<AuthPayload>> {
        let user = store(ctx)?
            .find_one(&|u: &User| u.user_name == user_name)
            .await
            .map_err(internal)?;
        let Some(user) = user.filter(|u| verify_password(&password, &u.password_hash)) else {
            debug!(user_name = %user_name, "login rejected");
            return Ok(None);
        };

        let token = ctx
            .data::<TokenAuthority>()?
            .mint(&user.id, &user.user_name, user.role)
            .map_err(internal)?;
        info!(user = user.id.as_str(), "login");

        Ok(Some(AuthPayload {
            token: Some(token),
            user: Some(user),
        }))
    }

    /// Tokens are stateless; the client drops its copy.
    async fn logout(&self) -> String {
        "Logged out successfully!".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::RequestIdentity;
    use crate::subgraph::provisioning::ProvisioningError;
    use crate::subgraph::store::InMemoryStore;
    use async_graphql::{Request, Variables};
    use async_trait::async_trait;
    use pretty_assertions::assert_eq;
    use serde_json::{Value, json};
    use std::sync::Mutex;
    use std::time::Duration;

    #[derive(Default)]
    struct RecordingProvisioner {
        fail: bool,
        calls: Mutex<Vec<NewAccount>>,
    }

    #[async_trait]
    impl Provisioner for RecordingProvisioner {
        async fn provision(&self, account: &NewAccount) -> Result<(), ProvisioningError> {
            self.calls.lock().unwrap().push(account.clone());
            if self.fail {
                Err(ProvisioningError::EmptyResult {
                    url: "http://patient/graphql".into(),
                })
            } else {
                Ok(())
            }
        }
    }

    struct Fixture {
        schema: UsersSchema,
        store: Arc<InMemoryStore<User>>,
        provisioner: Arc<RecordingProvisioner>,
        authority: TokenAuthority,
    }

    fn fixture(fail: bool) -> Fixture {
        let store = Arc::new(InMemoryStore::<User>::new());
        let provisioner = Arc::new(RecordingProvisioner {
            fail,
            ..Default::default()
        });
        let authority = TokenAuthority::with_secret("secret", Duration::from_secs(3600)).unwrap();
        let schema = build_schema(store.clone(), authority.clone(), provisioner.clone());
        Fixture {
            schema,
            store,
            provisioner,
            authority,
        }
    }

    impl Fixture {
        async fn run(&self, query: &str, token: Option<String>) -> Value {
            let identity = RequestIdentity::from_token(token, &self.authority);
            let response = self.schema.execute(Request::new(query).data(identity)).await;
            serde_json::to_value(&response).unwrap()
        }

        async fn signup(&self, name: &str, role: &str) -> Value {
            self.run(
                &format!(
                    r#"mutation {{ signup(userName: "{name}", email: "{name}@example.com", password: "secret1", role: "{role}") {{ id userName role }} }}"#
                ),
                None,
            )
            .await
        }
    }

    #[tokio::test]
    async fn test_signup_provisions_role_records() {
        let fixture = fixture(false);

        let resident = fixture.signup("rita", "RESIDENT").await;
        assert_eq!(resident["data"]["signup"]["role"], json!("RESIDENT"));
        assert!(fixture.provisioner.calls.lock().unwrap().is_empty());

        let patient = fixture.signup("pat", "patient").await;
        assert_eq!(patient["data"]["signup"]["role"], json!("PATIENT"));
        let calls = fixture.provisioner.calls.lock().unwrap().clone();
        assert_eq!(calls.len(), 1);
        assert_eq!(json!(calls[0].id), patient["data"]["signup"]["id"]);
        assert_eq!(calls[0].role, Role::Patient);
    }

    #[tokio::test]
    async fn test_failed_provisioning_keeps_the_user() {
        let fixture = fixture(true);

        let response = fixture.signup("pat", "PATIENT").await;
        assert_eq!(response["data"], Value::Null);
        assert_eq!(
            response["errors"][0]["message"],
            json!("Failed to create patient record")
        );
        assert_eq!(
            response["errors"][0]["extensions"]["code"],
            json!("PROVISIONING_FAILED")
        );

        let stored = fixture.store.find(&|_| true).await.unwrap();
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].user_name, "pat");
    }

    #[tokio::test]
    async fn test_signup_validation() {
        let fixture = fixture(false);
        fixture.signup("ann", "NURSE").await;

        let cases = [
            (
                r#"userName: "bob", email: "bob@example.com", password: "secret1", role: "ADMIN""#,
                "Invalid role: ADMIN",
            ),
            (
                r#"userName: "bob", email: "nope", password: "secret1", role: "NURSE""#,
                "Please fill a valid email address",
            ),
            (
                r#"userName: "bob", email: "bob@example.com", password: "abc", role: "NURSE""#,
                "Password must be at least 6 characters.",
            ),
            (
                r#"userName: "bob", email: "ann@example.com", password: "secret1", role: "NURSE""#,
                "Email already exists",
            ),
        ];
        for (arguments, message) in cases {
            let response = fixture
                .run(&format!("mutation {{ signup({arguments}) {{ id }} }}"), None)
                .await;
            assert_eq!(response["errors"][0]["message"], json!(message));
            assert_eq!(response["errors"][0]["extensions"]["code"], json!("BAD_USER_INPUT"));
        }
        assert_eq!(fixture.store.writes(), 1);
    }

    #[tokio::test]
    async fn test_login() {
        let fixture = fixture(false);
        fixture.signup("ann", "NURSE").await;

        let ok = fixture
            .run(
                r#"mutation { login(userName: "ann", password: "secret1") { token user { userName email role } } }"#,
                None,
            )
            .await;
        let token = ok["data"]["login"]["token"].as_str().unwrap().to_string();
        assert_eq!(
            ok["data"]["login"]["user"],
            json!({"userName": "ann", "email": "ann@example.com", "role": "NURSE"})
        );
        let principal = fixture.authority.verify(&token).unwrap();
        assert_eq!(principal.user_name, "ann");

        let me = fixture.run("{ isLoggedIn user { userName } }", Some(token)).await;
        assert_eq!(me["data"], json!({"isLoggedIn": true, "user": {"userName": "ann"}}));

        let wrong = fixture
            .run(r#"mutation { login(userName: "ann", password: "wrong!") { token } }"#, None)
            .await;
        assert_eq!(wrong, json!({"data": {"login": null}}));
    }

    #[tokio::test]
    async fn test_listing_users_requires_organizer() {
        let fixture = fixture(false);
        fixture.signup("ann", "NURSE").await;

        let anonymous = fixture.run("{ users { id } }", None).await;
        assert_eq!(anonymous["errors"][0]["extensions"]["code"], json!("UNAUTHENTICATED"));

        let nurse = fixture.authority.mint("n1", "ann", Role::Nurse).unwrap();
        let forbidden = fixture.run("{ users { id } }", Some(nurse)).await;
        assert_eq!(forbidden["errors"][0]["extensions"]["code"], json!("FORBIDDEN"));

        let organizer = fixture
            .authority
            .mint("o1", "olga", Role::CommunityOrganizer)
            .unwrap();
        let listed = fixture.run("{ users { userName } }", Some(organizer)).await;
        assert_eq!(listed["data"]["users"], json!([{"userName": "ann"}]));
    }

    #[tokio::test]
    async fn test_reference_resolution_is_read_only() {
        let fixture = fixture(false);
        let created = fixture.signup("ann", "RESIDENT").await;
        let id = created["data"]["signup"]["id"].clone();
        let writes = fixture.store.writes();

        let request = Request::new(
            "query($r: [_Any!]!) { _entities(representations: $r) { ... on User { userName } } }",
        )
        .variables(Variables::from_json(json!({"r": [
            {"__typename": "User", "id": id},
            {"__typename": "User", "id": id},
            {"__typename": "User", "id": "missing"}
        ]})));
        let response = serde_json::to_value(fixture.schema.execute(request).await).unwrap();

        assert_eq!(
            response["data"]["_entities"],
            json!([{"userName": "ann"}, {"userName": "ann"}, null])
        );
        assert_eq!(fixture.store.writes(), writes);
    }

    #[test]
    fn test_email_shape() {
        assert!(is_valid_email("a@b.co"));
        assert!(!is_valid_email("a@b."));
        assert!(!is_valid_email("@b.co"));
        assert!(!is_valid_email("a@.co"));
        assert!(!is_valid_email("ab.co"));
    }
}
