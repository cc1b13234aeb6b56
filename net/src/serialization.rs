/*
Turns application messages into packets and back using MessagePack. The
engine itself never looks inside a payload; this is a convenience for
applications that want typed messages on top of it.
*/
use bytes::BufMut;
use rmp_serde::{Deserializer, Serializer};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::sync::Arc;

use crate::{
    errors::{EngineError, EngineResult},
    packet::Packet,
    sockets::buffer_pool::BufferPool,
};

pub struct PacketSerializer {
    buffer_pool: Arc<BufferPool>,
}

impl PacketSerializer {
    pub fn new(buffer_pool: &Arc<BufferPool>) -> Self {
        Self {
            buffer_pool: buffer_pool.clone(),
        }
    }

    pub fn serialize<T: Serialize>(self: &Self, entity: &T) -> EngineResult<Packet> {
        let mut writer = self.buffer_pool.get(0).writer();
        match entity.serialize(&mut Serializer::new(&mut writer)) {
            Ok(_) => Ok(Packet::from_pooled(&self.buffer_pool, writer.into_inner())),
            Err(err) => Err(EngineError::Serialize {
                msg: format!("{err}"),
            }),
        }
    }

    pub fn deserialize<T: DeserializeOwned>(self: &Self, packet: &Packet) -> EngineResult<T> {
        packet.with_payload(|payload| {
            let mut deserializer = Deserializer::new(payload);
            Deserialize::deserialize(&mut deserializer).map_err(|err| EngineError::Serialize {
                msg: format!("{err:?}"),
            })
        })
    }
}
