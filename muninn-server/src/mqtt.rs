//! MQTT broker adapter
//!
//! Wraps rumqttc: connects to the broker, subscribes to every configured
//! topic filter, and feeds each incoming publish into the router. The
//! event loop runs until Ctrl+C; on reconnect, subscriptions are restored
//! when the new CONNACK arrives.

use anyhow::{Context, Result};
use muninn::message::Message;
use muninn::router::Router;
use rumqttc::{AsyncClient, Event, MqttOptions, Packet, QoS};
use std::time::Duration;
use tracing::{error, info, warn};

/// MQTT connection settings
pub struct MqttSettings {
  pub broker: String,
  pub client_id: String,
  pub username: String,
  pub password: String,
  pub qos: u8,
}

/// Run the broker event loop until Ctrl+C.
///
/// Each publish becomes a `Message` stamped with the arrival time and the
/// broker-provided retain flag, then goes through `Router::dispatch`. A
/// full route queue is logged and the message dropped; redelivery is left
/// to the broker session.
pub async fn run(settings: &MqttSettings, filters: &[String], router: &Router) -> Result<()> {
  let (host, port) = parse_broker(&settings.broker)?;
  let client_id = if settings.client_id.is_empty() {
    "muninn".to_string()
  } else {
    settings.client_id.clone()
  };

  let mut options = MqttOptions::new(client_id, host, port);
  options.set_keep_alive(Duration::from_secs(60));
  options.set_clean_session(true);
  if !settings.username.is_empty() {
    options.set_credentials(settings.username.clone(), settings.password.clone());
  }

  let (client, mut eventloop) = AsyncClient::new(options, 64);
  let qos = to_qos(settings.qos);

  info!("muninn is running. Press Ctrl+C to exit.");

  loop {
    tokio::select! {
      _ = tokio::signal::ctrl_c() => {
        info!("Shutting down muninn...");
        break;
      }
      event = eventloop.poll() => match event {
        Ok(Event::Incoming(Packet::ConnAck(_))) => {
          info!("Connected to MQTT broker");
          // (Re)subscribe on every CONNACK so reconnects restore state
          for filter in filters {
            client
              .subscribe(filter.clone(), qos)
              .await
              .with_context(|| format!("failed to subscribe to topic {filter}"))?;
            info!("Subscribed to topic filter: {} (qos={})", filter, settings.qos);
          }
        }
        Ok(Event::Incoming(Packet::Publish(publish))) => {
          let topic = publish.topic.clone();
          let message = Message {
            topic: publish.topic,
            payload: publish.payload.to_vec(),
            qos: qos_to_u8(publish.qos),
            retain: publish.retain,
            time: chrono::Utc::now(),
          };
          if let Err(e) = router.dispatch(message).await {
            warn!("Error processing message from topic {}: {}", topic, e);
          }
        }
        Ok(_) => {}
        Err(e) => {
          error!("MQTT connection lost: {}", e);
          tokio::time::sleep(Duration::from_secs(1)).await;
        }
      }
    }
  }

  let _ = client.disconnect().await;
  info!("Disconnected from the MQTT broker");
  Ok(())
}

/// Parse a broker address of the form `tcp://host:port`, `mqtt://host:port`
/// or `host:port`; the port defaults to 1883.
fn parse_broker(addr: &str) -> Result<(String, u16)> {
  let addr = addr
    .strip_prefix("tcp://")
    .or_else(|| addr.strip_prefix("mqtt://"))
    .unwrap_or(addr);

  match addr.rsplit_once(':') {
    Some((host, port)) => {
      let port = port
        .parse()
        .with_context(|| format!("invalid broker port in {addr}"))?;
      Ok((host.to_string(), port))
    }
    None => Ok((addr.to_string(), 1883)),
  }
}

fn to_qos(qos: u8) -> QoS {
  match qos {
    1 => QoS::AtLeastOnce,
    2 => QoS::ExactlyOnce,
    _ => QoS::AtMostOnce,
  }
}

fn qos_to_u8(qos: QoS) -> u8 {
  match qos {
    QoS::AtMostOnce => 0,
    QoS::AtLeastOnce => 1,
    QoS::ExactlyOnce => 2,
  }
}
