//! Community posts and help requests. Owns `Post` and `HelpRequest`;
//! authors and volunteers are `User` references.

use async_graphql::{
    ComplexObject, Context, EmptySubscription, ID, Object, Result, Schema, SimpleObject,
};
use std::sync::Arc;
use tracing::{debug, info};

use crate::identity::{Principal, Role};
use crate::subgraph::UserRef;
use crate::subgraph::guard::{self, bad_input, forbidden, internal, not_found};
use crate::subgraph::store::{Document, DocumentStore, new_id, timestamp};

pub type CommunitySchema = Schema<Query, Mutation, EmptySubscription>;
pub type PostStore = Arc<dyn DocumentStore<Post>>;
pub type HelpRequestStore = Arc<dyn DocumentStore<HelpRequest>>;

const CATEGORIES: [&str; 2] = ["news", "discussion"];

#[derive(SimpleObject, Clone, Debug)]
#[graphql(complex)]
pub struct Post {
    pub id: ID,
    pub title: String,
    pub content: String,
    pub category: String,
    #[graphql(skip)]
    pub author_id: ID,
    pub created_at: String,
    pub updated_at: Option<String>,
}

#[ComplexObject]
impl Post {
    async fn author(&self) -> UserRef {
        UserRef::new(&self.author_id)
    }
}

impl Document for Post {
    fn id(&self) -> &str {
        &self.id
    }
}

#[derive(SimpleObject, Clone, Debug)]
#[graphql(complex)]
pub struct HelpRequest {
    pub id: ID,
    pub description: String,
    pub location: Option<String>,
    pub is_resolved: bool,
    #[graphql(skip)]
    pub volunteer_ids: Vec<ID>,
    #[graphql(skip)]
    pub author_id: ID,
    pub created_at: String,
    pub updated_at: Option<String>,
}

#[ComplexObject]
impl HelpRequest {
    async fn volunteers(&self) -> Vec<UserRef> {
        self.volunteer_ids.iter().map(UserRef::new).collect()
    }

    async fn author(&self) -> UserRef {
        UserRef::new(&self.author_id)
    }
}

impl Document for HelpRequest {
    fn id(&self) -> &str {
        &self.id
    }
}

fn is_author(author_id: &ID, principal: &Principal) -> bool {
    author_id.as_str() == principal.id
}

fn is_author_or_organizer(author_id: &ID, principal: &Principal) -> bool {
    is_author(author_id, principal) || principal.role == Role::CommunityOrganizer
}

fn validate_category(category: &str) -> Result<()> {
    if CATEGORIES.contains(&category) {
        Ok(())
    } else {
        Err(bad_input(format!("Invalid category: {category}")))
    }
}

/// Empty strings leave the field unchanged.
fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.is_empty())
}

pub fn build_schema(posts: PostStore, help_requests: HelpRequestStore) -> CommunitySchema {
    Schema::build(Query, Mutation, EmptySubscription)
        .data(posts)
        .data(help_requests)
        .enable_federation()
        .finish()
}

fn posts<'a>(ctx: &'a Context<'_>) -> Result<&'a PostStore> {
    ctx.data::<PostStore>()
}

fn help_requests<'a>(ctx: &'a Context<'_>) -> Result<&'a HelpRequestStore> {
    ctx.data::<HelpRequestStore>()
}

async fn load_post(ctx: &Context<'_>, id: &ID) -> Result<Post> {
    posts(ctx)?
        .get(id)
        .await
        .map_err(internal)?
        .ok_or_else(|| not_found("Post not found"))
}

async fn load_help_request(ctx: &Context<'_>, id: &ID) -> Result<HelpRequest> {
    help_requests(ctx)?
        .get(id)
        .await
        .map_err(internal)?
        .ok_or_else(|| not_found("Help request not found"))
}

async fn update_help_request_with(
    ctx: &Context<'_>,
    id: &ID,
    apply: impl FnOnce(&mut HelpRequest) + Send + 'static,
) -> Result<HelpRequest> {
    help_requests(ctx)?
        .update(
            id,
            Box::new(move |request: &mut HelpRequest| {
                apply(request);
                request.updated_at = Some(timestamp());
            }),
        )
        .await
        .map_err(internal)?
        .ok_or_else(|| not_found("Help request not found"))
}

pub struct Query;

#[Object]
impl Query {
    async fn posts(&self, ctx: &Context<'_>) -> Result<Vec<Post>> {
        posts(ctx)?.find(&|_| true).await.map_err(internal)
    }

    async fn post(&self, ctx: &Context<'_>, id: ID) -> Result<Option<Post>> {
        posts(ctx)?.get(&id).await.map_err(internal)
    }

    async fn help_requests(&self, ctx: &Context<'_>) -> Result<Vec<HelpRequest>> {
        help_requests(ctx)?.find(&|_| true).await.map_err(internal)
    }

    async fn help_request(&self, ctx: &Context<'_>, id: ID) -> Result<Option<HelpRequest>> {
        help_requests(ctx)?.get(&id).await.map_err(internal)
    }

    #[graphql(entity)]
    async fn find_post_by_id(&self, ctx: &Context<'_>, id: ID) -> Result<Option<Post>> {
        debug!(post = id.as_str(), "resolving post reference");
        posts(ctx)?.get(&id).await.map_err(internal)
    }

    #[graphql(entity)]
    async fn find_help_request_by_id(
        &self,
        ctx: &Context<'_>,
        id: ID,
    ) -> Result<Option<HelpRequest>> {
        debug!(help_request = id.as_str(), "resolving help request reference");
        help_requests(ctx)?.get(&id).await.map_err(internal)
    }
}

pub struct Mutation;

#[Object]
impl Mutation {
    async fn create_post(
        &self,
        ctx: &Context<'_>,
        title: String,
        content: String,
        category: String,
    ) -> Result<Post> {
        let principal = guard::authenticated(ctx)?;
        validate_category(&category)?;

        let post = posts(ctx)?
            .create(Post {
                id: ID(new_id()),
                title,
                content,
                category,
                author_id: ID(principal.id.clone()),
                created_at: timestamp(),
                updated_at: None,
            })
            .await
            .map_err(internal)?;
        info!(post = post.id.as_str(), author = %principal.id, "post created");
        Ok(post)
    }

    async fn update_post(
        &self,
        ctx: &Context<'_>,
        id: ID,
        title: Option<String>,
        content: Option<String>,
        category: Option<String>,
    ) -> Result<Post> {
        let principal = guard::authenticated(ctx)?;
        let post = load_post(ctx, &id).await?;
        if !is_author(&post.author_id, principal) {
            return Err(forbidden("Not authorized to edit this post"));
        }
        let category = non_empty(category);
        if let Some(category) = &category {
            validate_category(category)?;
        }
        let (title, content) = (non_empty(title), non_empty(content));

        posts(ctx)?
            .update(
                &id,
                Box::new(move |post: &mut Post| {
                    if let Some(title) = title {
                        post.title = title;
                    }
                    if let Some(content) = content {
                        post.content = content;
                    }
                    if let Some(category) = category {
                        post.category = category;
                    }
                    post.updated_at = Some(timestamp());
                }),
            )
            .await
            .map_err(internal)?
            .ok_or_else(|| not_found("Post not found"))
    }

    async fn delete_post(&self, ctx: &Context<'_>, id: ID) -> Result<bool> {
        let principal = guard::authenticated(ctx)?;
        let post = load_post(ctx, &id).await?;
        if !is_author_or_organizer(&post.author_id, principal) {
            return Err(forbidden("Not authorized to delete this post"));
        }
        posts(ctx)?.delete(&id).await.map_err(internal)
    }

    async fn create_help_request(
        &self,
        ctx: &Context<'_>,
        description: String,
        location: Option<String>,
    ) -> Result<HelpRequest> {
        let principal = guard::authenticated(ctx)?;
        let request = help_requests(ctx)?
            .create(HelpRequest {
                id: ID(new_id()),
                description,
                location,
                is_resolved: false,
                volunteer_ids: Vec::new(),
                author_id: ID(principal.id.clone()),
                created_at: timestamp(),
                updated_at: None,
            })
            .await
            .map_err(internal)?;
        info!(help_request = request.id.as_str(), author = %principal.id, "help request created");
        Ok(request)
    }

    async fn update_help_request(
        &self,
        ctx: &Context<'_>,
        id: ID,
        description: Option<String>,
        location: Option<String>,
    ) -> Result<HelpRequest> {
        let principal = guard::authenticated(ctx)?;
        let request = load_help_request(ctx, &id).await?;
        if !is_author(&request.author_id, principal) {
            return Err(forbidden("Not authorized to edit this help request"));
        }
        let (description, location) = (non_empty(description), non_empty(location));

        update_help_request_with(ctx, &id, move |request| {
            if let Some(description) = description {
                request.description = description;
            }
            if let Some(location) = location {
                request.location = Some(location);
            }
        })
        .await
    }

    /// Adding someone already volunteering changes nothing.
    async fn add_volunteer_to_help_request(
        &self,
        ctx: &Context<'_>,
        id: ID,
        volunteer_id: ID,
    ) -> Result<HelpRequest> {
        guard::authorized(
            ctx,
            &[Role::CommunityOrganizer],
            "Only community organizers can add volunteers",
        )?;
        let request = load_help_request(ctx, &id).await?;
        if request.volunteer_ids.contains(&volunteer_id) {
            return Ok(request);
        }
        update_help_request_with(ctx, &id, move |request| request.volunteer_ids.push(volunteer_id)).await
    }

    async fn resolve_help_request(
        &self,
        ctx: &Context<'_>,
        id: ID,
        is_resolved: bool,
    ) -> Result<HelpRequest> {
        let principal = guard::authenticated(ctx)?;
        let request = load_help_request(ctx, &id).await?;
        if !is_author_or_organizer(&request.author_id, principal) {
            return Err(forbidden("Not authorized to resolve this help request"));
        }
        update_help_request_with(ctx, &id, move |request| request.is_resolved = is_resolved).await
    }

    async fn delete_help_request(&self, ctx: &Context<'_>, id: ID) -> Result<bool> {
        let principal = guard::authenticated(ctx)?;
        let request = load_help_request(ctx, &id).await?;
        if !is_author_or_organizer(&request.author_id, principal) {
            return Err(forbidden("Not authorized to delete this help request"));
        }
        help_requests(ctx)?.delete(&id).await.map_err(internal)
    }
}
