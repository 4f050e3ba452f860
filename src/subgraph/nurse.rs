//! Nurse records. Owns `Nurse`; assigned patients are `User` references.

use async_graphql::{
    ComplexObject, Context, EmptySubscription, ID, Object, Result, Schema, SimpleObject,
};
use std::sync::Arc;
use tracing::{debug, info};

use crate::identity::{Principal, Role};
use crate::subgraph::UserRef;
use crate::subgraph::guard::{self, bad_input, forbidden, internal, not_found};
use crate::subgraph::store::{Document, DocumentStore, new_id, timestamp};

pub type NurseSchema = Schema<Query, Mutation, EmptySubscription>;
pub type NurseStore = Arc<dyn DocumentStore<Nurse>>;

const DEFAULT_SPECIALIZATION: &str = "General";
const DEFAULT_TIP_CATEGORY: &str = "General";

#[derive(SimpleObject, Clone, Debug, PartialEq)]
pub struct MotivationalTip {
    pub id: ID,
    pub content: String,
    pub patient_id: ID,
    pub category: String,
    pub created_at: String,
}

#[derive(SimpleObject, Clone, Debug)]
#[graphql(complex)]
pub struct Nurse {
    pub id: ID,
    pub user_id: ID,
    pub specialization: String,
    /// `User.id`s of the patients in this nurse's care.
    pub patients: Vec<ID>,
    pub motivational_tips: Vec<MotivationalTip>,
    pub created_at: String,
    pub updated_at: String,
}

#[ComplexObject]
impl Nurse {
    async fn assigned_patients(&self) -> Vec<UserRef> {
        self.patients.iter().map(UserRef::new).collect()
    }
}

impl Nurse {
    fn new(user_id: &str) -> Self {
        let now = timestamp();
        Nurse {
            id: ID(new_id()),
            user_id: ID(user_id.to_string()),
            specialization: DEFAULT_SPECIALIZATION.to_string(),
            patients: Vec::new(),
            motivational_tips: Vec::new(),
            created_at: now.clone(),
            updated_at: now,
        }
    }

    fn belongs_to(&self, principal: &Principal) -> bool {
        self.user_id.as_str() == principal.id
    }
}

impl Document for Nurse {
    fn id(&self) -> &str {
        &self.id
    }
}

pub fn build_schema(store: NurseStore) -> NurseSchema {
    Schema::build(Query, Mutation, EmptySubscription)
        .data(store)
        .enable_federation()
        .finish()
}

fn store<'a>(ctx: &'a Context<'_>) -> Result<&'a NurseStore> {
    ctx.data::<NurseStore>()
}

/// Loads `nurse_id`, which must be the caller's own record.
async fn owned(ctx: &Context<'_>, nurse_id: &ID, denied: &str) -> Result<Nurse> {
    let principal = guard::authenticated(ctx)?;
    let nurse = store(ctx)?
        .get(nurse_id)
        .await
        .map_err(internal)?
        .ok_or_else(|| not_found(format!("Nurse with ID {} not found", nurse_id.as_str())))?;
    if !nurse.belongs_to(principal) {
        return Err(forbidden(denied));
    }
    Ok(nurse)
}

pub struct Query;

#[Object]
impl Query {
    async fn nurses(&self, ctx: &Context<'_>) -> Result<Vec<Nurse>> {
        guard::authorized(ctx, &[Role::Nurse], "Not authorized to view all nurses")?;
        store(ctx)?.find(&|_| true).await.map_err(internal)
    }

    async fn nurse(&self, ctx: &Context<'_>, id: ID) -> Result<Option<Nurse>> {
        owned(ctx, &id, "Not authorized to view this nurse").await.map(Some)
    }

    async fn nurse_by_user_id(&self, ctx: &Context<'_>, user_id: ID) -> Result<Option<Nurse>> {
        let principal = guard::authenticated(ctx)?;
        if user_id.as_str() != principal.id && principal.role != Role::Nurse {
            return Err(forbidden("Not authorized to view this nurse"));
        }
        store(ctx)?
            .find_one(&|n: &Nurse| n.user_id == user_id)
            .await
            .map_err(internal)
    }

    async fn nurse_patients(&self, ctx: &Context<'_>, nurse_id: ID) -> Result<Vec<ID>> {
        let nurse = owned(ctx, &nurse_id, "Not authorized to view this nurse's patients").await?;
        Ok(nurse.patients)
    }

    /// Tips for `patient_id` across all nurses, newest first. Patients see
    /// only their own.
    async fn motivational_tips(
        &self,
        ctx: &Context<'_>,
        patient_id: ID,
    ) -> Result<Vec<MotivationalTip>> {
        let principal = guard::authenticated(ctx)?;
        if principal.role != Role::Nurse && principal.id != patient_id.as_str() {
            return Err(forbidden(
                "Not authorized to view motivational tips for this patient",
            ));
        }

        let nurses = store(ctx)?.find(&|_| true).await.map_err(internal)?;
        let mut tips: Vec<MotivationalTip> = nurses
            .into_iter()
            .flat_map(|nurse| nurse.motivational_tips)
            .filter(|tip| tip.patient_id == patient_id)
            .collect();
        tips.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(tips)
    }

    #[graphql(entity)]
    async fn find_nurse_by_id(&self, ctx: &Context<'_>, id: ID) -> Result<Option<Nurse>> {
        debug!(nurse = id.as_str(), "resolving nurse reference");
        store(ctx)?.get(&id).await.map_err(internal)
    }
}

pub struct Mutation;

#[Object]
impl Mutation {
    /// Creates the caller's record, or returns the existing one.
    async fn initialize_nurse_data(&self, ctx: &Context<'_>) -> Result<Nurse> {
        let principal = guard::authorized(ctx, &[Role::Nurse], "Only nurses can initialize nurse data")?;
        let store = store(ctx)?;
        let user = principal.id.clone();

        if let Some(existing) = store
            .find_one(&|n: &Nurse| n.user_id.as_str() == user)
            .await
            .map_err(internal)?
        {
            debug!(user = %user, "nurse record already initialized");
            return Ok(existing);
        }

        let nurse = store.create(Nurse::new(&principal.id)).await.map_err(internal)?;
        info!(user = %principal.id, nurse = nurse.id.as_str(), "nurse record initialized");
        Ok(nurse)
    }

    async fn add_patient_to_nurse(
        &self,
        ctx: &Context<'_>,
        nurse_id: ID,
        patient_id: ID,
    ) -> Result<Nurse> {
        let nurse = owned(ctx, &nurse_id, "Not authorized to modify this nurse").await?;
        if nurse.patients.contains(&patient_id) {
            return Err(bad_input("Patient already assigned to this nurse"));
        }

        store(ctx)?
            .update(
                &nurse.id,
                Box::new(move |nurse: &mut Nurse| {
                    nurse.patients.push(patient_id);
                    nurse.updated_at = timestamp();
                }),
            )
            .await
            .map_err(internal)?
            .ok_or_else(|| not_found(format!("Nurse with ID {} not found", nurse_id.as_str())))
    }

    async fn add_motivational_tip(
        &self,
        ctx: &Context<'_>,
        nurse_id: ID,
        patient_id: ID,
        content: String,
    ) -> Result<MotivationalTip> {
        let nurse = owned(ctx, &nurse_id, "Not authorized to add motivational tip as this nurse").await?;
        if !nurse.patients.contains(&patient_id) {
            return Err(bad_input("Nurse is not assigned to this patient"));
        }

        let tip = MotivationalTip {
            id: ID(new_id()),
            content,
            patient_id,
            category: DEFAULT_TIP_CATEGORY.to_string(),
            created_at: timestamp(),
        };
        let pushed = tip.clone();
        store(ctx)?
            .update(
                &nurse.id,
                Box::new(move |nurse: &mut Nurse| {
                    nurse.motivational_tips.push(pushed);
                    nurse.updated_at = timestamp();
                }),
            )
            .await
            .map_err(internal)?
            .ok_or_else(|| not_found(format!("Nurse with ID {} not found", nurse_id.as_str())))?;
        Ok(tip)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::{RequestIdentity, TokenAuthority};
    use crate::subgraph::store::InMemoryStore;
    use async_graphql::Request;
    use pretty_assertions::assert_eq;
    use serde_json::{Value, json};
    use std::time::Duration;

    struct Fixture {
        schema: NurseSchema,
        store: Arc<InMemoryStore<Nurse>>,
        authority: TokenAuthority,
    }

    fn fixture() -> Fixture {
        let store = Arc::new(InMemoryStore::<Nurse>::new());
        Fixture {
            schema: build_schema(store.clone()),
            store,
            authority: TokenAuthority::with_secret("secret", Duration::from_secs(3600)).unwrap(),
        }
    }

    impl Fixture {
        fn token(&self, id: &str, role: Role) -> String {
            self.authority.mint(id, id, role).unwrap()
        }

        async fn run(&self, query: &str, token: &str) -> Value {
            let identity = RequestIdentity::from_token(Some(token.to_string()), &self.authority);
            let response = self.schema.execute(Request::new(query).data(identity)).await;
            serde_json::to_value(&response).unwrap()
        }

        async fn initialize(&self, token: &str) -> String {
            let created = self
                .run("mutation { initializeNurseData { id } }", token)
                .await;
            created["data"]["initializeNurseData"]["id"]
                .as_str()
                .unwrap()
                .to_string()
        }
    }

    #[tokio::test]
    async fn test_initialize_is_idempotent() {
        let fixture = fixture();
        let nurse = fixture.token("n1", Role::Nurse);

        let first = fixture.initialize(&nurse).await;
        let second = fixture.initialize(&nurse).await;
        assert_eq!(first, second);
        assert_eq!(fixture.store.writes(), 1);

        let patient = fixture.token("p1", Role::Patient);
        let denied = fixture
            .run("mutation { initializeNurseData { id } }", &patient)
            .await;
        assert_eq!(denied["errors"][0]["extensions"]["code"], json!("FORBIDDEN"));
    }

    #[tokio::test]
    async fn test_assigned_patients_are_user_references() {
        let fixture = fixture();
        let nurse = fixture.token("n1", Role::Nurse);
        let id = fixture.initialize(&nurse).await;

        let added = fixture
            .run(
                &format!(
                    r#"mutation {{ addPatientToNurse(nurseId: "{id}", patientId: "p1") {{ patients assignedPatients {{ __typename id }} }} }}"#
                ),
                &nurse,
            )
            .await;
        assert_eq!(
            added["data"]["addPatientToNurse"],
            json!({"patients": ["p1"], "assignedPatients": [{"__typename": "User", "id": "p1"}]})
        );

        let again = fixture
            .run(
                &format!(r#"mutation {{ addPatientToNurse(nurseId: "{id}", patientId: "p1") {{ id }} }}"#),
                &nurse,
            )
            .await;
        assert_eq!(
            again["errors"][0]["message"],
            json!("Patient already assigned to this nurse")
        );
    }

    #[tokio::test]
    async fn test_motivational_tips() {
        let fixture = fixture();
        let nurse = fixture.token("n1", Role::Nurse);
        let id = fixture.initialize(&nurse).await;

        let unassigned = fixture
            .run(
                &format!(
                    r#"mutation {{ addMotivationalTip(nurseId: "{id}", patientId: "p1", content: "walk daily") {{ id }} }}"#
                ),
                &nurse,
            )
            .await;
        assert_eq!(
            unassigned["errors"][0]["message"],
            json!("Nurse is not assigned to this patient")
        );

        fixture
            .run(
                &format!(r#"mutation {{ addPatientToNurse(nurseId: "{id}", patientId: "p1") {{ id }} }}"#),
                &nurse,
            )
            .await;
        fixture
            .run(
                &format!(
                    r#"mutation {{ addMotivationalTip(nurseId: "{id}", patientId: "p1", content: "walk daily") {{ id }} }}"#
                ),
                &nurse,
            )
            .await;

        let own = fixture
            .run(
                r#"{ motivationalTips(patientId: "p1") { content category } }"#,
                &fixture.token("p1", Role::Patient),
            )
            .await;
        assert_eq!(
            own["data"]["motivationalTips"],
            json!([{"content": "walk daily", "category": "General"}])
        );

        let other = fixture
            .run(
                r#"{ motivationalTips(patientId: "p1") { content } }"#,
                &fixture.token("p2", Role::Patient),
            )
            .await;
        assert_eq!(other["errors"][0]["extensions"]["code"], json!("FORBIDDEN"));
    }

    #[tokio::test]
    async fn test_other_nurses_cannot_modify() {
        let fixture = fixture();
        let id = fixture.initialize(&fixture.token("n1", Role::Nurse)).await;

        let response = fixture
            .run(
                &format!(r#"mutation {{ addPatientToNurse(nurseId: "{id}", patientId: "p1") {{ id }} }}"#),
                &fixture.token("n2", Role::Nurse),
            )
            .await;
        assert_eq!(
            response["errors"][0]["message"],
            json!("Not authorized to modify this nurse")
        );
        assert_eq!(fixture.store.writes(), 1);
    }
}
