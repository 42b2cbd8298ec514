//! Closed-group lifecycle operations initiated by the local user.
//!
//! Key rotation keeps the invariant that a key pair is persisted locally
//! only after its distribution message was accepted by the network.

use std::collections::BTreeSet;

use futures_util::future::try_join_all;
use tracing::{info, warn};

use crate::crypto::encrypt_session;
use crate::groups::{GroupEvent, GroupKeyPair, GroupMembership};
use crate::keys::parse_session_id;
use crate::message::{ClosedGroupControlMessage, KeyPairWrapper, Message, MessageKind};
use crate::sender::MessageSender;
use crate::transport::Destination;
use crate::types::{SendError, SendResult};

fn control(message: ClosedGroupControlMessage) -> Message {
    Message::new(MessageKind::ClosedGroupControl(message))
}

fn group_destination(group: &str) -> Destination {
    Destination::ClosedGroup {
        group_public_key: group.to_string(),
    }
}

impl MessageSender {
    /// Create a closed group and invite `members`.
    ///
    /// The local user is always added and becomes the only admin. Returns
    /// the group public key.
    pub async fn create_closed_group(
        &self,
        name: &str,
        members: impl IntoIterator<Item = String>,
    ) -> SendResult<String> {
        let user_id = self.session_id();
        let mut members: BTreeSet<String> = members.into_iter().collect();
        members.insert(user_id.clone());

        let group = GroupKeyPair::generate().identity();
        let key_pair = GroupKeyPair::generate();
        let admins = vec![user_id.clone()];
        let formation_timestamp = self.next_timestamp();

        let membership = GroupMembership::new(
            group.clone(),
            name,
            members.iter().cloned(),
            admins.clone(),
            formation_timestamp,
        );
        self.services.groups.set_membership(membership).await?;
        self.services.groups.append_key(&group, key_pair.clone()).await?;

        if let Err(e) = self.services.push.subscribe(&group, &user_id).await {
            warn!(group = %group, error = %e, "Couldn't subscribe to group notifications");
        }
        self.services.poller.start_polling(&group).await;
        self.services
            .events
            .emit(GroupEvent::Created {
                group: group.clone(),
                name: name.to_string(),
            })
            .await;

        let new_group = ClosedGroupControlMessage::New {
            public_key: group.clone(),
            name: name.to_string(),
            key_pair,
            members: members.iter().cloned().collect(),
            admins,
            expiration_timer: 0,
        };
        let sends = members.iter().map(|member| {
            let mut message = control(new_group.clone());
            message.sent_timestamp = Some(formation_timestamp);
            let destination = Destination::Contact {
                public_key: member.clone(),
            };
            async move { self.send(message, &destination).await }
        });
        try_join_all(sends).await?;

        info!(group = %group, members = members.len(), "Created closed group");
        Ok(group)
    }

    /// Bring the group to the given name and member set.
    pub async fn update(
        &self,
        group: &str,
        members: BTreeSet<String>,
        name: &str,
    ) -> SendResult<()> {
        let mut membership = self
            .services
            .groups
            .membership(group)
            .await?
            .ok_or(SendError::NoThread)?;

        if membership.name != name {
            membership.name = name.to_string();
            self.services.groups.set_membership(membership.clone()).await?;
            self.services
                .events
                .emit(GroupEvent::NameChanged {
                    group: group.to_string(),
                    name: name.to_string(),
                })
                .await;
            self.send(
                control(ClosedGroupControlMessage::NameChange {
                    name: name.to_string(),
                }),
                &group_destination(group),
            )
            .await?;
        }

        let current: BTreeSet<String> = membership
            .members
            .union(&membership.zombies)
            .cloned()
            .collect();

        let added: BTreeSet<String> = members.difference(&current).cloned().collect();
        if !added.is_empty() {
            self.add_members(group, added).await?;
        }

        let removed: BTreeSet<String> = current.difference(&members).cloned().collect();
        if !removed.is_empty() {
            self.remove_members(group, removed).await?;
        }
        Ok(())
    }

    /// Announce new members to the group and invite them.
    pub async fn add_members(&self, group: &str, added: BTreeSet<String>) -> SendResult<()> {
        let mut membership = self
            .services
            .groups
            .membership(group)
            .await?
            .ok_or(SendError::NoThread)?;
        let key_pair = self
            .services
            .groups
            .latest_key(group)
            .await?
            .ok_or(SendError::NoKeyPair)?;

        let added_list: Vec<String> = added.iter().cloned().collect();
        self.send(
            control(ClosedGroupControlMessage::MembersAdded {
                members: added_list.clone(),
            }),
            &group_destination(group),
        )
        .await?;

        membership.members.extend(added.iter().cloned());
        let invite = ClosedGroupControlMessage::New {
            public_key: group.to_string(),
            name: membership.name.clone(),
            key_pair,
            members: membership.members.iter().cloned().collect(),
            admins: membership.admins.clone(),
            expiration_timer: membership.expiration_timer,
        };
        let sends = added.iter().map(|member| {
            let message = control(invite.clone());
            let destination = Destination::Contact {
                public_key: member.clone(),
            };
            async move { self.send(message, &destination).await }
        });
        try_join_all(sends).await?;

        self.services.groups.set_membership(membership).await?;
        self.services
            .events
            .emit(GroupEvent::MembersAdded {
                group: group.to_string(),
                members: added_list,
            })
            .await;
        Ok(())
    }

    /// Remove members and rotate the group key for those who remain.
    ///
    /// Only admins may remove members, and an admin cannot remove themselves
    /// this way (they leave instead).
    pub async fn remove_members(&self, group: &str, removed: BTreeSet<String>) -> SendResult<()> {
        let user_id = self.session_id();
        let mut membership = self
            .services
            .groups
            .membership(group)
            .await?
            .ok_or(SendError::NoThread)?;

        if removed.contains(&user_id) {
            warn!(group = %group, "Use leave() to remove yourself from a group");
            return Err(SendError::InvalidClosedGroupUpdate);
        }
        if !membership.is_admin(&user_id) {
            warn!(group = %group, "Only an admin can remove members");
            return Err(SendError::InvalidClosedGroupUpdate);
        }

        let removed_list: Vec<String> = removed.iter().cloned().collect();
        membership.members.retain(|m| !removed.contains(m));
        membership.zombies.retain(|m| !removed.contains(m));
        let remaining: Vec<String> = membership.members.iter().cloned().collect();
        self.services.groups.set_membership(membership).await?;
        self.services
            .events
            .emit(GroupEvent::MembersRemoved {
                group: group.to_string(),
                members: removed_list.clone(),
            })
            .await;

        self.send(
            control(ClosedGroupControlMessage::MembersRemoved {
                members: removed_list,
            }),
            &group_destination(group),
        )
        .await?;

        self.rotate_and_distribute(group, &remaining).await?;
        Ok(())
    }

    /// Generate a new group key pair and distribute it to `targets`.
    ///
    /// The key pair is stored only once the distribution message has been
    /// accepted by the network. While in flight it is visible to
    /// [`MessageSender::send_latest_key_pair`].
    pub async fn rotate_and_distribute(
        &self,
        group: &str,
        targets: &[String],
    ) -> SendResult<GroupKeyPair> {
        let membership = self
            .services
            .groups
            .membership(group)
            .await?
            .ok_or(SendError::NoThread)?;
        if !membership.is_admin(&self.session_id()) {
            return Err(SendError::InvalidClosedGroupUpdate);
        }

        let key_pair = GroupKeyPair::generate();
        let payload = key_pair
            .to_payload()
            .map_err(|_| SendError::ProtoConversionFailed)?;

        let wrappers = targets
            .iter()
            .map(|target| -> SendResult<KeyPairWrapper> {
                let target_key =
                    parse_session_id(target).map_err(|_| SendError::NoUserPublicKey)?;
                Ok(KeyPairWrapper {
                    public_key: target.clone(),
                    encrypted_key_pair: encrypt_session(&payload, &target_key, &self.keys)?,
                })
            })
            .collect::<SendResult<Vec<_>>>()?;

        self.distributing
            .write()
            .await
            .entry(group.to_string())
            .or_default()
            .push(key_pair.clone());

        let result = self
            .send(
                control(ClosedGroupControlMessage::EncryptionKeyPair {
                    public_key: None,
                    wrappers,
                }),
                &group_destination(group),
            )
            .await;

        if result.is_ok() {
            if let Err(e) = self.services.groups.append_key(group, key_pair.clone()).await {
                self.finish_distribution(group, &key_pair).await;
                return Err(e.into());
            }
        }
        self.finish_distribution(group, &key_pair).await;

        result?;
        info!(group = %group, recipients = targets.len(), "Distributed new group key pair");
        Ok(key_pair)
    }

    async fn finish_distribution(&self, group: &str, key_pair: &GroupKeyPair) {
        let mut distributing = self.distributing.write().await;
        if let Some(pending) = distributing.get_mut(group) {
            pending.retain(|k| k != key_pair);
            if pending.is_empty() {
                distributing.remove(group);
            }
        }
    }

    /// Leave the group.
    ///
    /// When an admin leaves the group is disbanded for everyone.
    pub async fn leave(&self, group: &str) -> SendResult<()> {
        let user_id = self.session_id();
        let mut membership = self
            .services
            .groups
            .membership(group)
            .await?
            .ok_or(SendError::NoThread)?;

        self.send(
            control(ClosedGroupControlMessage::MemberLeft),
            &group_destination(group),
        )
        .await?;

        if membership.is_admin(&user_id) {
            membership.members.clear();
        } else {
            membership.members.remove(&user_id);
        }
        self.services.groups.set_membership(membership).await?;
        self.services.poller.stop_polling(group).await;
        self.services.groups.purge_group(group).await?;
        if let Err(e) = self.services.push.unsubscribe(group, &user_id).await {
            warn!(group = %group, error = %e, "Couldn't unsubscribe from group notifications");
        }
        Ok(())
    }

    /// Send the group's current key pair to one member, 1:1.
    ///
    /// A key pair still being distributed wins over the stored latest one.
    pub async fn send_latest_key_pair(&self, member: &str, group: &str) -> SendResult<()> {
        let membership = self
            .services
            .groups
            .membership(group)
            .await?
            .ok_or(SendError::NoThread)?;
        if !membership.is_member(member) {
            warn!(group = %group, member = %member, "Refusing to send key pair to a non-member");
            return Err(SendError::InvalidClosedGroupUpdate);
        }

        let pending = self
            .distributing
            .read()
            .await
            .get(group)
            .and_then(|keys| keys.last().cloned());
        let key_pair = match pending {
            Some(key_pair) => key_pair,
            None => self
                .services
                .groups
                .latest_key(group)
                .await?
                .ok_or(SendError::NoKeyPair)?,
        };

        let member_key = parse_session_id(member).map_err(|_| SendError::NoUserPublicKey)?;
        let payload = key_pair
            .to_payload()
            .map_err(|_| SendError::ProtoConversionFailed)?;
        let wrapper = KeyPairWrapper {
            public_key: member.to_string(),
            encrypted_key_pair: encrypt_session(&payload, &member_key, &self.keys)?,
        };

        info!(group = %group, member = %member, "Sending latest key pair");
        self.send(
            control(ClosedGroupControlMessage::EncryptionKeyPair {
                public_key: Some(group.to_string()),
                wrappers: vec![wrapper],
            }),
            &Destination::Contact {
                public_key: member.to_string(),
            },
        )
        .await?;
        Ok(())
    }
}
