//! Typed request bodies and their wire encodings.

use bitflags::bitflags;

use super::{codec, Opcode};
use crate::{
    error::Result,
    options::{Consistency, ProtocolVersion},
};

bitflags! {
    /// The flag bits of QUERY/EXECUTE parameters.
    #[derive(Clone, Copy, Debug)]
    pub(crate) struct QueryFlags: u8 {
        const VALUES                  = 0x01;
        const SKIP_METADATA           = 0x02;
        const PAGE_SIZE               = 0x04;
        const WITH_PAGING_STATE       = 0x08;
        const WITH_SERIAL_CONSISTENCY = 0x10;
        const WITH_DEFAULT_TIMESTAMP  = 0x20;
    }
}

/// The `<query_parameters>` shared by QUERY and EXECUTE.
#[derive(Clone, Debug)]
pub(crate) struct QueryParameters {
    pub(crate) consistency: Consistency,
    pub(crate) values: Vec<Option<Vec<u8>>>,
    pub(crate) skip_metadata: bool,
    pub(crate) page_size: Option<i32>,
    pub(crate) paging_state: Option<Vec<u8>>,
    pub(crate) serial_consistency: Option<Consistency>,
    pub(crate) timestamp: Option<i64>,
}

impl Default for QueryParameters {
    fn default() -> Self {
        Self {
            consistency: Consistency::LocalOne,
            values: Vec::new(),
            skip_metadata: false,
            page_size: None,
            paging_state: None,
            serial_consistency: None,
            timestamp: None,
        }
    }
}

impl QueryParameters {
    fn write(&self, version: ProtocolVersion, buf: &mut Vec<u8>) {
        codec::write_consistency(buf, self.consistency);

        let mut flags = QueryFlags::empty();
        if !self.values.is_empty() {
            flags |= QueryFlags::VALUES;
        }
        if self.skip_metadata {
            flags |= QueryFlags::SKIP_METADATA;
        }
        if self.page_size.is_some() {
            flags |= QueryFlags::PAGE_SIZE;
        }
        if self.paging_state.is_some() {
            flags |= QueryFlags::WITH_PAGING_STATE;
        }
        if self.serial_consistency.is_some() {
            flags |= QueryFlags::WITH_SERIAL_CONSISTENCY;
        }
        if self.timestamp.is_some() && version >= ProtocolVersion::V3 {
            flags |= QueryFlags::WITH_DEFAULT_TIMESTAMP;
        }
        codec::write_u8(buf, flags.bits());

        if flags.contains(QueryFlags::VALUES) {
            codec::write_u16(buf, self.values.len() as u16);
            for value in &self.values {
                codec::write_bytes_opt(buf, value.as_deref());
            }
        }
        if let Some(page_size) = self.page_size {
            codec::write_i32(buf, page_size);
        }
        if let Some(ref paging_state) = self.paging_state {
            codec::write_bytes_opt(buf, Some(paging_state));
        }
        if let Some(serial) = self.serial_consistency {
            codec::write_consistency(buf, serial);
        }
        if flags.contains(QueryFlags::WITH_DEFAULT_TIMESTAMP) {
            if let Some(timestamp) = self.timestamp {
                codec::write_i64(buf, timestamp);
            }
        }
    }
}

/// One statement inside a BATCH.
#[derive(Clone, Debug)]
pub(crate) enum BatchStatement {
    Query {
        query: String,
        values: Vec<Option<Vec<u8>>>,
    },
    Prepared {
        id: Vec<u8>,
        values: Vec<Option<Vec<u8>>>,
    },
}

/// The body of a BATCH request.
#[derive(Clone, Debug)]
pub(crate) struct BatchRequest {
    /// 0 = logged, 1 = unlogged, 2 = counter.
    pub(crate) batch_type: u8,
    pub(crate) statements: Vec<BatchStatement>,
    pub(crate) consistency: Consistency,
    pub(crate) serial_consistency: Option<Consistency>,
    pub(crate) timestamp: Option<i64>,
}

/// A request frame body, one variant per client-to-server opcode.
#[derive(Clone, Debug)]
pub(crate) enum Request {
    Startup {
        options: Vec<(String, String)>,
    },
    Options,
    AuthResponse {
        token: Option<Vec<u8>>,
    },
    Query {
        query: String,
        parameters: QueryParameters,
    },
    Prepare {
        query: String,
    },
    Execute {
        id: Vec<u8>,
        parameters: QueryParameters,
    },
    Batch(BatchRequest),
    Register {
        events: Vec<String>,
    },
}

impl Request {
    pub(crate) fn opcode(&self) -> Opcode {
        match self {
            Request::Startup { .. } => Opcode::Startup,
            Request::Options => Opcode::Options,
            Request::AuthResponse { .. } => Opcode::AuthResponse,
            Request::Query { .. } => Opcode::Query,
            Request::Prepare { .. } => Opcode::Prepare,
            Request::Execute { .. } => Opcode::Execute,
            Request::Batch(_) => Opcode::Batch,
            Request::Register { .. } => Opcode::Register,
        }
    }

    pub(crate) fn write_body(&self, version: ProtocolVersion, buf: &mut Vec<u8>) -> Result<()> {
        match self {
            Request::Startup { options } => {
                codec::write_string_map(
                    buf,
                    options.iter().map(|(k, v)| (k.as_str(), v.as_str())),
                );
            }
            Request::Options => {}
            Request::AuthResponse { token } => {
                codec::write_bytes_opt(buf, token.as_deref());
            }
            Request::Query { query, parameters } => {
                codec::write_long_string(buf, query);
                parameters.write(version, buf);
            }
            Request::Prepare { query } => {
                codec::write_long_string(buf, query);
            }
            Request::Execute { id, parameters } => {
                codec::write_short_bytes(buf, id);
                parameters.write(version, buf);
            }
            Request::Batch(batch) => {
                codec::write_u8(buf, batch.batch_type);
                codec::write_u16(buf, batch.statements.len() as u16);
                for statement in &batch.statements {
                    match statement {
                        BatchStatement::Query { query, values } => {
                            codec::write_u8(buf, 0);
                            codec::write_long_string(buf, query);
                            codec::write_u16(buf, values.len() as u16);
                            for value in values {
                                codec::write_bytes_opt(buf, value.as_deref());
                            }
                        }
                        BatchStatement::Prepared { id, values } => {
                            codec::write_u8(buf, 1);
                            codec::write_short_bytes(buf, id);
                            codec::write_u16(buf, values.len() as u16);
                            for value in values {
                                codec::write_bytes_opt(buf, value.as_deref());
                            }
                        }
                    }
                }
                codec::write_consistency(buf, batch.consistency);

                let mut flags = QueryFlags::empty();
                if batch.serial_consistency.is_some() {
                    flags |= QueryFlags::WITH_SERIAL_CONSISTENCY;
                }
                if batch.timestamp.is_some() {
                    flags |= QueryFlags::WITH_DEFAULT_TIMESTAMP;
                }
                codec::write_u8(buf, flags.bits());
                if let Some(serial) = batch.serial_consistency {
                    codec::write_consistency(buf, serial);
                }
                if let Some(timestamp) = batch.timestamp {
                    codec::write_i64(buf, timestamp);
                }
            }
            Request::Register { events } => {
                codec::write_string_list(buf, events);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::frame::codec::BodyReader;
    use pretty_assertions::assert_eq;

    #[test]
    fn query_body_carries_flags_in_order() {
        let request = Request::Query {
            query: "SELECT cluster_name FROM system.local".to_string(),
            parameters: QueryParameters {
                consistency: Consistency::Quorum,
                values: vec![Some(vec![0x01])],
                page_size: Some(5000),
                timestamp: Some(42),
                ..Default::default()
            },
        };
        let mut buf = Vec::new();
        request.write_body(ProtocolVersion::V4, &mut buf).unwrap();

        let mut reader = BodyReader::new(&buf);
        assert_eq!(
            reader.read_long_string().unwrap(),
            "SELECT cluster_name FROM system.local"
        );
        assert_eq!(reader.read_consistency().unwrap(), Consistency::Quorum);
        let flags = QueryFlags::from_bits_truncate(reader.read_u8().unwrap());
        assert!(flags.contains(QueryFlags::VALUES));
        assert!(flags.contains(QueryFlags::PAGE_SIZE));
        assert!(flags.contains(QueryFlags::WITH_DEFAULT_TIMESTAMP));
        assert_eq!(reader.read_u16().unwrap(), 1);
        assert_eq!(reader.read_bytes_opt().unwrap(), Some(vec![0x01]));
        assert_eq!(reader.read_i32().unwrap(), 5000);
        assert_eq!(reader.read_i64().unwrap(), 42);
        assert_eq!(reader.remaining(), 0);
    }

    #[test]
    fn startup_body_is_a_string_map() {
        let request = Request::Startup {
            options: vec![("CQL_VERSION".to_string(), "3.0.0".to_string())],
        };
        let mut buf = Vec::new();
        request.write_body(ProtocolVersion::V4, &mut buf).unwrap();
        let mut reader = BodyReader::new(&buf);
        assert_eq!(reader.read_u16().unwrap(), 1);
        assert_eq!(reader.read_string().unwrap(), "CQL_VERSION");
        assert_eq!(reader.read_string().unwrap(), "3.0.0");
    }
}
