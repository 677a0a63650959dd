//! Scripted CoAP device for simulations.

use std::{collections::VecDeque, net::SocketAddr, time::Duration};

use bytes::Bytes;
use cairn_proto::{Code, Message, MessageKind, MessageOption, Token, numbers};
use tokio::time::Instant;
use turmoil::net::UdpSocket;

/// Deadline used while no notification is scheduled.
const IDLE: Duration = Duration::from_secs(86_400);

/// A mote serving one observable resource from a scripted reading list.
///
/// The device consumes its readings front-to-back: an observe
/// registration answers with the next reading piggybacked, then the rest
/// flow as notifications on the configured interval. Fault knobs let
/// tests force retransmissions, duplicate deliveries, and silence.
pub struct SimDevice {
    resource: String,
    readings: VecDeque<(u32, String)>,
    notify_interval: Duration,
    ignore_requests: u32,
    duplicate_notifications: bool,
    confirmable_notifications: bool,
    observe_supported: bool,
    pause_after: Option<u32>,
}

impl SimDevice {
    /// A device serving `resource` with no readings scripted yet.
    pub fn new(resource: impl Into<String>) -> Self {
        Self {
            resource: resource.into(),
            readings: VecDeque::new(),
            notify_interval: Duration::from_secs(5),
            ignore_requests: 0,
            duplicate_notifications: false,
            confirmable_notifications: false,
            observe_supported: true,
            pause_after: None,
        }
    }

    /// Append a scripted reading (notification sequence number, text
    /// payload).
    #[must_use]
    pub fn reading(mut self, sequence: u32, payload: &str) -> Self {
        self.readings.push_back((sequence, payload.to_owned()));
        self
    }

    /// Interval between notifications.
    #[must_use]
    pub fn notify_interval(mut self, interval: Duration) -> Self {
        self.notify_interval = interval;
        self
    }

    /// Silently drop the first `count` matching requests, forcing the
    /// collector to retransmit.
    #[must_use]
    pub fn ignore_requests(mut self, count: u32) -> Self {
        self.ignore_requests = count;
        self
    }

    /// Send every notification twice with the same message-id.
    #[must_use]
    pub fn duplicate_notifications(mut self) -> Self {
        self.duplicate_notifications = true;
        self
    }

    /// Send notifications as confirmable messages.
    #[must_use]
    pub fn confirmable_notifications(mut self) -> Self {
        self.confirmable_notifications = true;
        self
    }

    /// Answer GETs plainly, never establishing an observation.
    #[must_use]
    pub fn without_observe(mut self) -> Self {
        self.observe_supported = false;
        self
    }

    /// Go silent after that many sends, until the next registration.
    #[must_use]
    pub fn pause_after(mut self, sends: u32) -> Self {
        self.pause_after = Some(sends);
        self
    }

    /// Serve requests on the given socket until the simulation ends.
    ///
    /// # Errors
    ///
    /// Returns socket or encoding errors to fail the simulated host.
    pub async fn serve(mut self, socket: UdpSocket) -> turmoil::Result {
        let mut buf = vec![0u8; 2048];
        let mut observer: Option<(SocketAddr, Token)> = None;
        let mut next_mid: u16 = 0x7000;
        let mut next_notify: Option<Instant> = None;
        let mut sent: u32 = 0;
        let mut ignored: u32 = 0;

        loop {
            let notify_at = next_notify.unwrap_or_else(|| Instant::now() + IDLE);

            tokio::select! {
                biased;

                received = socket.recv_from(&mut buf) => {
                    let (len, peer) = received?;
                    let Ok(request) = Message::decode(&buf[..len]) else { continue };

                    match request.kind {
                        MessageKind::Confirmable | MessageKind::NonConfirmable
                            if request.code == Code::GET
                                && request.uri_path() == self.resource =>
                        {
                            if ignored < self.ignore_requests {
                                ignored += 1;
                                continue;
                            }

                            let Some((sequence, payload)) = self.readings.pop_front() else {
                                continue;
                            };

                            if self.observe_supported && request.observe() == Some(0) {
                                let response = response_for(&request, Some(sequence), &payload);
                                socket.send_to(&response.encode()?, peer).await?;
                                observer = Some((peer, request.token));
                                sent += 1;
                                next_notify = self.schedule_next(sent);
                            } else {
                                let response = response_for(&request, None, &payload);
                                socket.send_to(&response.encode()?, peer).await?;
                            }
                        },

                        MessageKind::Reset => {
                            observer = None;
                            next_notify = None;
                        },

                        // Acks for confirmable notifications.
                        MessageKind::Acknowledgement => {},

                        _ => {},
                    }
                },

                () = tokio::time::sleep_until(notify_at),
                    if next_notify.is_some() && observer.is_some() =>
                {
                    let Some((peer, token)) = observer else { continue };
                    let Some((sequence, payload)) = self.readings.pop_front() else {
                        next_notify = None;
                        continue;
                    };

                    let kind = if self.confirmable_notifications {
                        MessageKind::Confirmable
                    } else {
                        MessageKind::NonConfirmable
                    };

                    let mut notification = Message::new(kind, Code::CONTENT, next_mid);
                    next_mid = next_mid.wrapping_add(1);
                    notification.token = token;
                    notification.push_option(MessageOption::uint(numbers::OBSERVE, sequence)?);
                    notification.push_option(MessageOption::uint(numbers::CONTENT_FORMAT, 0)?);
                    notification.payload = Bytes::from(payload.into_bytes());

                    let bytes = notification.encode()?;
                    socket.send_to(&bytes, peer).await?;
                    if self.duplicate_notifications {
                        socket.send_to(&bytes, peer).await?;
                    }

                    sent += 1;
                    next_notify = self.schedule_next(sent);
                },
            }
        }
    }

    /// Deadline for the next notification, or `None` when the script is
    /// drained or a scripted pause kicked in (one-shot; registration
    /// resumes delivery).
    fn schedule_next(&mut self, sent: u32) -> Option<Instant> {
        if self.readings.is_empty() {
            return None;
        }
        if self.pause_after.take_if(|n| sent >= *n).is_some() {
            return None;
        }
        Some(Instant::now() + self.notify_interval)
    }
}

/// Piggybacked 2.05 response, with the Observe option when registering.
fn response_for(request: &Message, sequence: Option<u32>, payload: &str) -> Message {
    let mut response =
        Message::new(MessageKind::Acknowledgement, Code::CONTENT, request.message_id);
    response.token = request.token;

    if let Some(sequence) = sequence
        && let Ok(opt) = MessageOption::uint(numbers::OBSERVE, sequence)
    {
        response.push_option(opt);
    }
    if let Ok(opt) = MessageOption::uint(numbers::CONTENT_FORMAT, 0) {
        response.push_option(opt);
    }

    response.payload = Bytes::copy_from_slice(payload.as_bytes());
    response
}
