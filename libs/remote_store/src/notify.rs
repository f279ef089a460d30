//! Pub/sub control plane used to manage the push-notification subscription:
//! subscribe at start-up, confirm when the provider calls back, unsubscribe
//! at shutdown.

use std::sync::Mutex;

use anyhow::Context;
use async_trait::async_trait;
use aws_sdk_sns::config::Region;

/// The calls the mirror issues against the pub/sub service. Object-safe so
/// tests can substitute a recording implementation.
#[async_trait]
pub trait SubscriptionControl: Send + Sync {
    /// Requests a subscription of `endpoint` to `topic_arn` and returns the
    /// subscription identifier (ARN). The subscription stays pending until
    /// the provider's confirmation callback is answered with
    /// [`SubscriptionControl::confirm_subscription`].
    async fn subscribe(
        &self,
        topic_arn: &str,
        endpoint: &str,
        protocol: &str,
    ) -> anyhow::Result<String>;

    async fn confirm_subscription(&self, topic_arn: &str, token: &str) -> anyhow::Result<()>;

    async fn unsubscribe(&self, subscription_arn: &str) -> anyhow::Result<()>;
}

/// AWS SNS implementation.
pub struct SnsControl {
    client: aws_sdk_sns::Client,
}

impl SnsControl {
    pub async fn new(region: String, endpoint: Option<String>) -> Self {
        let mut loader =
            aws_config::defaults(aws_config::BehaviorVersion::v2023_11_09()).region(Region::new(region));
        if let Some(endpoint) = endpoint {
            loader = loader.endpoint_url(endpoint);
        }
        let config = loader.load().await;
        Self {
            client: aws_sdk_sns::Client::new(&config),
        }
    }
}

#[async_trait]
impl SubscriptionControl for SnsControl {
    async fn subscribe(
        &self,
        topic_arn: &str,
        endpoint: &str,
        protocol: &str,
    ) -> anyhow::Result<String> {
        let response = self
            .client
            .subscribe()
            .topic_arn(topic_arn)
            .endpoint(endpoint)
            .protocol(protocol)
            .return_subscription_arn(true)
            .send()
            .await
            .context("SNS Subscribe")?;
        response
            .subscription_arn
            .context("SNS Subscribe response without a subscription ARN")
    }

    async fn confirm_subscription(&self, topic_arn: &str, token: &str) -> anyhow::Result<()> {
        self.client
            .confirm_subscription()
            .topic_arn(topic_arn)
            .token(token)
            .send()
            .await
            .context("SNS ConfirmSubscription")?;
        Ok(())
    }

    async fn unsubscribe(&self, subscription_arn: &str) -> anyhow::Result<()> {
        self.client
            .unsubscribe()
            .subscription_arn(subscription_arn)
            .send()
            .await
            .context("SNS Unsubscribe")?;
        Ok(())
    }
}

/// What a [`RecordingControl`] has been asked to do.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlCall {
    Subscribe {
        topic_arn: String,
        endpoint: String,
        protocol: String,
    },
    ConfirmSubscription {
        topic_arn: String,
        token: String,
    },
    Unsubscribe {
        subscription_arn: String,
    },
}

/// Test double that records every call and hands out a fixed subscription ARN.
#[derive(Debug, Default)]
pub struct RecordingControl {
    calls: Mutex<Vec<ControlCall>>,
}

impl RecordingControl {
    pub const SUBSCRIPTION_ARN: &'static str =
        "arn:aws:sns:us-east-1:000000000000:mirror-topic:deadbeef";

    pub fn calls(&self) -> Vec<ControlCall> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl SubscriptionControl for RecordingControl {
    async fn subscribe(
        &self,
        topic_arn: &str,
        endpoint: &str,
        protocol: &str,
    ) -> anyhow::Result<String> {
        self.calls.lock().unwrap().push(ControlCall::Subscribe {
            topic_arn: topic_arn.to_owned(),
            endpoint: endpoint.to_owned(),
            protocol: protocol.to_owned(),
        });
        Ok(Self::SUBSCRIPTION_ARN.to_owned())
    }

    async fn confirm_subscription(&self, topic_arn: &str, token: &str) -> anyhow::Result<()> {
        self.calls
            .lock()
            .unwrap()
            .push(ControlCall::ConfirmSubscription {
                topic_arn: topic_arn.to_owned(),
                token: token.to_owned(),
            });
        Ok(())
    }

    async fn unsubscribe(&self, subscription_arn: &str) -> anyhow::Result<()> {
        self.calls.lock().unwrap().push(ControlCall::Unsubscribe {
            subscription_arn: subscription_arn.to_owned(),
        });
        Ok(())
    }
}
