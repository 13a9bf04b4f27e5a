//! Bucket notification topics on the gateway's SNS API, and the notifications that use them

pub mod sns;

use futures::StreamExt;
use k8s_openapi::api::core::v1::Secret;
use kube::{
    api::Api,
    runtime::{
        controller::{Action, Controller},
        finalizer::{finalizer, Event as Finalizer},
        watcher::Config,
    },
    Client, ResourceExt,
};
use std::sync::Arc;
use tracing::*;

use self::sns::{topic_attributes, validate_arn, SnsClient};
use crate::{
    api::v1::{
        finalizer_name,
        notifications::{CephBucketNotification, CephBucketTopic},
        pools::CephObjectStore,
    },
    controllers::{
        context::{Context, State},
        find_cluster, finalizer_error, finish, require_cluster,
    },
    reporting::{update_status, Phase},
    util::{
        errors::{Error, Result, ResultExt, StdError, TRANSIENT_REQUEUE},
        k8s::{get_opt, namespace_of},
        telemetry,
    },
};

const TOPIC_KIND: &str = "CephBucketTopic";
const TOPIC_CONTROLLER: &str = "buckettopic";
const NOTIFICATION_CONTROLLER: &str = "bucketnotification";

/// Gateway user whose keys sign the SNS requests
pub const ADMIN_OPS_USER: &str = "rgw-admin-ops-user";
const ACCESS_KEY: &str = "AccessKey";
const SECRET_KEY: &str = "SecretKey";

pub fn object_user_secret_name(store: &str, user: &str) -> String {
    format!("rook-ceph-object-user-{store}-{user}")
}

/// In-cluster gateway endpoint of an object store
pub fn gateway_endpoint(store: &CephObjectStore, namespace: &str) -> String {
    format!(
        "http://rook-ceph-rgw-{}.{}.svc:{}",
        store.name_any(),
        namespace,
        store.spec.gateway.port
    )
}

/// Namespace of the store a topic publishes through; the topic's own when unset
fn store_namespace(topic: &CephBucketTopic) -> Result<String> {
    match topic.spec.object_store_namespace.as_str() {
        "" => namespace_of(topic),
        ns => Ok(ns.to_string()),
    }
}

async fn object_store(client: &Client, namespace: &str, name: &str) -> Result<Option<CephObjectStore>> {
    let stores: Api<CephObjectStore> = Api::namespaced(client.clone(), namespace);
    get_opt(&stores, name).await.context("failed to get object store")
}

/// Access and secret key of the admin ops user of `store`
async fn user_credentials(client: &Client, namespace: &str, store: &str) -> Result<(String, String)> {
    let name = object_user_secret_name(store, ADMIN_OPS_USER);
    let secrets: Api<Secret> = Api::namespaced(client.clone(), namespace);
    let secret = get_opt(&secrets, &name)
        .await
        .context("failed to get object user secret")?
        .ok_or_else(|| Error::dependency(format!("Secret {namespace}/{name}"), "object user secret does not exist"))?;
    let key = |k: &str| {
        secret
            .data
            .as_ref()
            .and_then(|d| d.get(k))
            .map(|v| String::from_utf8_lossy(&v.0).into_owned())
            .filter(|v| !v.is_empty())
            .ok_or_else(|| Error::StdError(StdError::DecodingError(format!("secret {name} has no '{k}'"))))
    };
    Ok((key(ACCESS_KEY)?, key(SECRET_KEY)?))
}

/// A Ready store and an SNS client signing as its admin ops user
async fn topic_client(client: &Client, topic: &CephBucketTopic) -> Result<SnsClient> {
    let ns = store_namespace(topic)?;
    let name = &topic.spec.object_store_name;
    let store = object_store(client, &ns, name)
        .await?
        .ok_or_else(|| Error::dependency(format!("CephObjectStore {ns}/{name}"), "object store does not exist"))?;
    if !store.is_ready() {
        return Err(Error::dependency(
            format!("CephObjectStore {ns}/{name}"),
            "object store is not ready",
        ));
    }
    let (access_key, secret_key) = user_credentials(client, &ns, name).await?;
    SnsClient::new(&gateway_endpoint(&store, &ns), &access_key, &secret_key)
}

async fn apply_topic(topic: &CephBucketTopic, ctx: &Context) -> Result<Action> {
    let client = ctx.client.clone();
    require_cluster(&client, &store_namespace(topic)?).await?;
    let sns = topic_client(&client, topic).await?;

    let arn = sns.create_topic(&topic.name_any(), &topic_attributes(&topic.spec)).await?;
    let api: Api<CephBucketTopic> = Api::namespaced(client, &namespace_of(topic)?);
    update_status(&api, &topic.name_any(), ctx.config.status_update_retries, |status| {
        status.arn = Some(arn.clone());
    })
    .await?;
    Ok(Action::await_change())
}

async fn cleanup_topic(topic: &CephBucketTopic, ctx: &Context) -> Result<Action> {
    let Some(arn) = topic.arn() else {
        debug!("topic {} was never provisioned", topic.name_any());
        return Ok(Action::await_change());
    };
    let client = ctx.client.clone();
    let ns = store_namespace(topic)?;
    if find_cluster(&client, &ns).await?.is_none() {
        info!("cluster of topic {} is gone, nothing to delete", topic.name_any());
        return Ok(Action::await_change());
    }
    if object_store(&client, &ns, &topic.spec.object_store_name).await?.is_none() {
        info!("object store of topic {} is gone, nothing to delete", topic.name_any());
        return Ok(Action::await_change());
    }
    topic_client(&client, topic).await?.delete_topic(arn).await?;
    Ok(Action::await_change())
}

#[instrument(skip(ctx, topic), fields(trace_id))]
pub async fn reconcile_topic(topic: Arc<CephBucketTopic>, ctx: Arc<Context>) -> Result<Action> {
    let trace_id = telemetry::get_trace_id();
    Span::current().record("trace_id", field::display(&trace_id));
    let _timer = ctx.metrics.count_and_measure(TOPIC_CONTROLLER);
    ctx.record_event(TOPIC_CONTROLLER).await;

    let ns = namespace_of(topic.as_ref())?;
    let topics: Api<CephBucketTopic> = Api::namespaced(ctx.client.clone(), &ns);
    info!("Reconciling CephBucketTopic \"{}\" in {}", topic.name_any(), ns);
    let result = finalizer(&topics, &finalizer_name(TOPIC_KIND), topic.clone(), |event| async {
        match event {
            Finalizer::Apply(topic) => apply_topic(&topic, &ctx).await,
            Finalizer::Cleanup(topic) => cleanup_topic(&topic, &ctx).await,
        }
    })
    .await
    .map_err(finalizer_error);
    finish(&ctx, topic.as_ref(), result, Phase::Ready).await
}

/// A notification is usable once its topic has been provisioned
pub async fn check_topic(client: &Client, notification: &CephBucketNotification) -> Result<Action> {
    let ns = namespace_of(notification)?;
    let name = &notification.spec.topic;
    if name.is_empty() {
        return Err(Error::Invalid("missing topic".to_string()));
    }
    let topics: Api<CephBucketTopic> = Api::namespaced(client.clone(), &ns);
    let topic = get_opt(&topics, name)
        .await
        .context("failed to get bucket topic")?
        .ok_or_else(|| Error::dependency(format!("CephBucketTopic {ns}/{name}"), "topic does not exist"))?;
    let arn = topic
        .arn()
        .ok_or_else(|| Error::dependency(format!("CephBucketTopic {ns}/{name}"), "topic has no ARN yet"))?;
    validate_arn(arn)?;
    debug!("notification {} uses topic {}", notification.name_any(), arn);
    Ok(Action::await_change())
}

#[instrument(skip(ctx, notification), fields(trace_id))]
pub async fn reconcile_notification(notification: Arc<CephBucketNotification>, ctx: Arc<Context>) -> Result<Action> {
    let trace_id = telemetry::get_trace_id();
    Span::current().record("trace_id", field::display(&trace_id));
    let _timer = ctx.metrics.count_and_measure(NOTIFICATION_CONTROLLER);
    ctx.record_event(NOTIFICATION_CONTROLLER).await;

    if notification.metadata.deletion_timestamp.is_some() {
        return Ok(Action::await_change());
    }
    let result = check_topic(&ctx.client, notification.as_ref()).await;
    ctx.report(notification.as_ref(), result, Phase::Ready).await
}

fn topic_error_policy(topic: Arc<CephBucketTopic>, error: &Error, ctx: Arc<Context>) -> Action {
    warn!("reconcile of CephBucketTopic {} failed: {:?}", topic.name_any(), error);
    ctx.metrics.reconcile_failure(topic.as_ref(), error);
    Action::requeue(error.requeue_after().unwrap_or(TRANSIENT_REQUEUE))
}

fn notification_error_policy(notification: Arc<CephBucketNotification>, error: &Error, ctx: Arc<Context>) -> Action {
    warn!("reconcile of CephBucketNotification {} failed: {:?}", notification.name_any(), error);
    ctx.metrics.reconcile_failure(notification.as_ref(), error);
    Action::requeue(error.requeue_after().unwrap_or(TRANSIENT_REQUEUE))
}

pub async fn run_topics(state: State, client: Client) {
    let topics = Api::<CephBucketTopic>::all(client.clone());
    Controller::new(topics, Config::default().any_semantic())
        .shutdown_on_signal()
        .run(reconcile_topic, topic_error_policy, state.to_context(client))
        .filter_map(|x| async move { std::result::Result::ok(x) })
        .for_each(|_| futures::future::ready(()))
        .await;
}

pub async fn run_notifications(state: State, client: Client) {
    let notifications = Api::<CephBucketNotification>::all(client.clone());
    Controller::new(notifications, Config::default().any_semantic())
        .shutdown_on_signal()
        .run(reconcile_notification, notification_error_policy, state.to_context(client))
        .filter_map(|x| async move { std::result::Result::ok(x) })
        .for_each(|_| futures::future::ready(()))
        .await;
}
