//! Patient records. Owns `PatientData`; `PatientData.user` is the owning
//! `User.id` and is never dereferenced here.

use async_graphql::{
    Context, EmptySubscription, ID, InputObject, Object, Result, Schema, SimpleObject,
};
use std::sync::Arc;
use tracing::{debug, info};

use crate::identity::{Principal, Role};
use crate::subgraph::guard::{self, forbidden, internal, not_found};
use crate::subgraph::store::{Document, DocumentStore, new_id, timestamp};

pub type PatientSchema = Schema<Query, Mutation, EmptySubscription>;
pub type PatientStore = Arc<dyn DocumentStore<PatientData>>;

/// Copies every `Some` field of `$input` onto `$target`.
macro_rules! merge_flags {
    ($target:expr, $input:expr, $($field:ident),+ $(,)?) => {
        $(
            if let Some(value) = $input.$field {
                $target.$field = value;
            }
        )+
    };
}

#[derive(SimpleObject, Clone, Debug, PartialEq)]
pub struct EmergencyAlert {
    pub id: ID,
    pub content: String,
    pub create_date: String,
}

/// Which measurements the patient is asked for each day.
#[derive(SimpleObject, Clone, Debug, PartialEq)]
pub struct DailyInfoRequired {
    pub pulse_rate: bool,
    pub blood_pressure: bool,
    pub weight: bool,
    pub temperature: bool,
    pub respiratory_rate: bool,
}

impl Default for DailyInfoRequired {
    fn default() -> Self {
        DailyInfoRequired {
            pulse_rate: true,
            blood_pressure: true,
            weight: true,
            temperature: true,
            respiratory_rate: true,
        }
    }
}

#[derive(SimpleObject, Clone, Debug, PartialEq)]
pub struct DailyRecord {
    pub id: ID,
    pub date: String,
    pub pulse_rate: Option<f64>,
    pub blood_pressure: Option<f64>,
    pub weight: Option<f64>,
    pub temperature: Option<f64>,
    pub respiratory_rate: Option<f64>,
}

#[derive(SimpleObject, Clone, Debug, Default, PartialEq)]
pub struct Symptoms {
    pub breathing_problem: bool,
    pub fever: bool,
    pub dry_cough: bool,
    pub sore_throat: bool,
    pub running_nose: bool,
    pub asthma: bool,
    pub chronic_lung_disease: bool,
    pub headache: bool,
    pub heart_disease: bool,
    pub diabetes: bool,
    pub hyper_tension: bool,
    pub fatigue: bool,
    pub gastrointestinal: bool,
    pub abroad_travel: bool,
    pub contact_with_covid_patient: bool,
    pub attended_large_gathering: bool,
    pub visited_public_exposed_places: bool,
    pub family_working_in_public_exposed_places: bool,
    pub wearing_masks: bool,
    pub sanitization_from_market: bool,
}

#[derive(InputObject, Clone, Debug, Default)]
pub struct SymptomsInput {
    pub breathing_problem: Option<bool>,
    pub fever: Option<bool>,
    pub dry_cough: Option<bool>,
    pub sore_throat: Option<bool>,
    pub running_nose: Option<bool>,
    pub asthma: Option<bool>,
    pub chronic_lung_disease: Option<bool>,
    pub headache: Option<bool>,
    pub heart_disease: Option<bool>,
    pub diabetes: Option<bool>,
    pub hyper_tension: Option<bool>,
    pub fatigue: Option<bool>,
    pub gastrointestinal: Option<bool>,
    pub abroad_travel: Option<bool>,
    pub contact_with_covid_patient: Option<bool>,
    pub attended_large_gathering: Option<bool>,
    pub visited_public_exposed_places: Option<bool>,
    pub family_working_in_public_exposed_places: Option<bool>,
    pub wearing_masks: Option<bool>,
    pub sanitization_from_market: Option<bool>,
}

impl Symptoms {
    fn apply(&mut self, input: SymptomsInput) {
        merge_flags!(
            self,
            input,
            breathing_problem,
            fever,
            dry_cough,
            sore_throat,
            running_nose,
            asthma,
            chronic_lung_disease,
            headache,
            heart_disease,
            diabetes,
            hyper_tension,
            fatigue,
            gastrointestinal,
            abroad_travel,
            contact_with_covid_patient,
            attended_large_gathering,
            visited_public_exposed_places,
            family_working_in_public_exposed_places,
            wearing_masks,
            sanitization_from_market,
        );
    }
}

struct DailyInfoUpdate {
    pulse_rate: Option<bool>,
    blood_pressure: Option<bool>,
    weight: Option<bool>,
    temperature: Option<bool>,
    respiratory_rate: Option<bool>,
}

#[derive(SimpleObject, Clone, Debug)]
pub struct PatientData {
    pub id: ID,
    pub user: ID,
    pub emergency_alerts: Vec<EmergencyAlert>,
    pub daily_info_required: DailyInfoRequired,
    pub daily_records: Vec<DailyRecord>,
    pub symptoms: Symptoms,
    pub created_at: String,
    pub updated_at: String,
}

impl PatientData {
    fn new(user: &str) -> Self {
        let now = timestamp();
        PatientData {
            id: ID(new_id()),
            user: ID(user.to_string()),
            emergency_alerts: Vec::new(),
            daily_info_required: DailyInfoRequired::default(),
            daily_records: Vec::new(),
            symptoms: Symptoms::default(),
            created_at: now.clone(),
            updated_at: now,
        }
    }

    /// Nurses see every record; anyone else only their own.
    fn visible_to(&self, principal: &Principal) -> bool {
        principal.role == Role::Nurse || self.user.as_str() == principal.id
    }
}

impl Document for PatientData {
    fn id(&self) -> &str {
        &self.id
    }
}

pub fn build_schema(store: PatientStore) -> PatientSchema {
    Schema::build(Query, Mutation, EmptySubscription)
        .data(store)
        .enable_federation()
        .finish()
}

fn store<'a>(ctx: &'a Context<'_>) -> Result<&'a PatientStore> {
    ctx.data::<PatientStore>()
}

/// Loads `patient_id` and checks the caller may read it.
async fn readable(ctx: &Context<'_>, patient_id: &ID, denied: &str) -> Result<PatientData> {
    let principal = guard::authenticated(ctx)?;
    let record = store(ctx)?
        .get(patient_id)
        .await
        .map_err(internal)?
        .ok_or_else(|| not_found(format!("Patient with ID {} not found", patient_id.as_str())))?;
    if !record.visible_to(principal) {
        return Err(forbidden(denied));
    }
    Ok(record)
}

/// The caller's own record.
async fn own_record(ctx: &Context<'_>) -> Result<PatientData> {
    let principal = guard::authenticated(ctx)?;
    let user = principal.id.clone();
    store(ctx)?
        .find_one(&|p: &PatientData| p.user.as_str() == user)
        .await
        .map_err(internal)?
        .ok_or_else(|| not_found("No patient record for this user"))
}

async fn modify(
    ctx: &Context<'_>,
    id: &ID,
    apply: impl FnOnce(&mut PatientData) + Send + 'static,
) -> Result<PatientData> {
    store(ctx)?
        .update(
            id,
            Box::new(move |record: &mut PatientData| {
                apply(record);
                record.updated_at = timestamp();
            }),
        )
        .await
        .map_err(internal)?
        .ok_or_else(|| not_found(format!("Patient with ID {} not found", id.as_str())))
}

pub struct Query;

#[Object]
impl Query {
    async fn patients_data(&self, ctx: &Context<'_>) -> Result<Vec<PatientData>> {
        guard::authorized(ctx, &[Role::Nurse], "Not authorized to view all patients")?;
        store(ctx)?.find(&|_| true).await.map_err(internal)
    }

    async fn patient_data(&self, ctx: &Context<'_>, id: ID) -> Result<Option<PatientData>> {
        readable(ctx, &id, "Not authorized to view this patient")
            .await
            .map(Some)
    }

    async fn patient_data_by_user_id(
        &self,
        ctx: &Context<'_>,
        user_id: ID,
    ) -> Result<Option<PatientData>> {
        let principal = guard::authenticated(ctx)?;
        if principal.role != Role::Nurse && user_id.as_str() != principal.id {
            return Err(forbidden("Not authorized to view this patient"));
        }
        store(ctx)?
            .find_one(&|p: &PatientData| p.user == user_id)
            .await
            .map_err(internal)
    }

    /// Every alert, newest first.
    async fn emergency_alerts(&self, ctx: &Context<'_>) -> Result<Vec<EmergencyAlert>> {
        guard::authorized(ctx, &[Role::Nurse], "Not authorized to view all emergency alerts")?;
        let records = store(ctx)?.find(&|_| true).await.map_err(internal)?;
        let mut alerts: Vec<EmergencyAlert> = records
            .into_iter()
            .flat_map(|record| record.emergency_alerts)
            .collect();
        alerts.sort_by(|a, b| b.create_date.cmp(&a.create_date));
        Ok(alerts)
    }

    async fn patient_emergency_alerts(
        &self,
        ctx: &Context<'_>,
        patient_id: ID,
    ) -> Result<Vec<EmergencyAlert>> {
        let record = readable(
            ctx,
            &patient_id,
            "Not authorized to view this patient's emergency alerts",
        )
        .await?;
        Ok(record.emergency_alerts)
    }

    async fn patient_daily_records(
        &self,
        ctx: &Context<'_>,
        patient_id: ID,
    ) -> Result<Vec<DailyRecord>> {
        let record = readable(ctx, &patient_id, "Not authorized to view this patient's daily records").await?;
        Ok(record.daily_records)
    }

    async fn patient_symptoms(&self, ctx: &Context<'_>, patient_id: ID) -> Result<Symptoms> {
        let record = readable(ctx, &patient_id, "Not authorized to view this patient's symptoms").await?;
        Ok(record.symptoms)
    }

    async fn patient_daily_info_required(
        &self,
        ctx: &Context<'_>,
        patient_id: ID,
    ) -> Result<DailyInfoRequired> {
        let record = readable(ctx, &patient_id, "Not authorized to view this patient").await?;
        Ok(record.daily_info_required)
    }

    #[graphql(entity)]
    async fn find_patient_data_by_id(
        &self,
        ctx: &Context<'_>,
        id: ID,
    ) -> Result<Option<PatientData>> {
        debug!(patient = id.as_str(), "resolving patient reference");
        store(ctx)?.get(&id).await.map_err(internal)
    }
}

pub struct Mutation;

#[Object]
impl Mutation {
    /// Creates the caller's record with default flags, or returns the one
    /// that already exists.
    async fn initialize_patient_data(&self, ctx: &Context<'_>) -> Result<PatientData> {
        let principal = guard::authorized(ctx, &[Role::Patient], "Only patients can initialize patient data")?;
        let store = store(ctx)?;
        let user = principal.id.clone();

        if let Some(existing) = store
            .find_one(&|p: &PatientData| p.user.as_str() == user)
            .await
            .map_err(internal)?
        {
            debug!(user = %user, "patient record already initialized");
            return Ok(existing);
        }

        let record = store
            .create(PatientData::new(&principal.id))
            .await
            .map_err(internal)?;
        info!(user = %principal.id, patient = record.id.as_str(), "patient record initialized");
        Ok(record)
    }

    async fn create_emergency_alert(
        &self,
        ctx: &Context<'_>,
        content: String,
    ) -> Result<EmergencyAlert> {
        let record = own_record(ctx).await?;
        let alert = EmergencyAlert {
            id: ID(new_id()),
            content,
            create_date: timestamp(),
        };

        let pushed = alert.clone();
        modify(ctx, &record.id, move |record| record.emergency_alerts.push(pushed)).await?;
        info!(patient = record.id.as_str(), "emergency alert raised");
        Ok(alert)
    }

    async fn add_daily_record(
        &self,
        ctx: &Context<'_>,
        date: String,
        pulse_rate: Option<f64>,
        blood_pressure: Option<f64>,
        weight: Option<f64>,
        temperature: Option<f64>,
        respiratory_rate: Option<f64>,
    ) -> Result<DailyRecord> {
        let record = own_record(ctx).await?;
        let daily = DailyRecord {
            id: ID(new_id()),
            date,
            pulse_rate,
            blood_pressure,
            weight,
            temperature,
            respiratory_rate,
        };

        let pushed = daily.clone();
        modify(ctx, &record.id, move |record| record.daily_records.push(pushed)).await?;
        Ok(daily)
    }

    async fn add_symptom(&self, ctx: &Context<'_>, symptoms: SymptomsInput) -> Result<Symptoms> {
        let record = own_record(ctx).await?;
        let updated = modify(ctx, &record.id, move |record| record.symptoms.apply(symptoms)).await?;
        Ok(updated.symptoms)
    }

    async fn update_patient_daily_info_required(
        &self,
        ctx: &Context<'_>,
        patient_id: ID,
        pulse_rate: Option<bool>,
        blood_pressure: Option<bool>,
        weight: Option<bool>,
        temperature: Option<bool>,
        respiratory_rate: Option<bool>,
    ) -> Result<PatientData> {
        guard::authorized(
            ctx,
            &[Role::Nurse],
            "Not authorized to update daily info requirements for this patient",
        )?;
        let update = DailyInfoUpdate {
            pulse_rate,
            blood_pressure,
            weight,
            temperature,
            respiratory_rate,
        };
        modify(ctx, &patient_id, move |record| {
            merge_flags!(
                record.daily_info_required,
                update,
                pulse_rate,
                blood_pressure,
                weight,
                temperature,
                respiratory_rate,
            );
        })
        .await
    }
}
