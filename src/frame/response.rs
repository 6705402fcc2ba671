//! Typed response bodies and their wire decodings.

use std::{collections::HashMap, net::SocketAddr};

use uuid::Uuid;

use super::{
    codec::BodyReader,
    Frame,
    FrameFlags,
    Opcode,
};
use crate::{
    error::{DbError, Error, Result, ServerError, WriteType},
    options::ProtocolVersion,
};

/// A response frame decoded into its typed body, along with the envelope extras
/// (tracing id, warnings) that may precede it.
#[derive(Debug)]
pub(crate) struct ParsedResponse {
    pub(crate) tracing_id: Option<Uuid>,
    pub(crate) warnings: Vec<String>,
    pub(crate) kind: Response,
}

/// A response body, one variant per server-to-client opcode.
#[derive(Debug)]
pub(crate) enum Response {
    Ready,
    Authenticate {
        authenticator: String,
    },
    Supported {
        options: HashMap<String, Vec<String>>,
    },
    AuthChallenge {
        token: Option<Vec<u8>>,
    },
    AuthSuccess {
        token: Option<Vec<u8>>,
    },
    Result(CqlResult),
    Event(ServerEvent),
    Error(ServerError),
}

impl Response {
    pub(crate) fn deserialize(frame: &Frame, version: ProtocolVersion) -> Result<ParsedResponse> {
        let mut reader = BodyReader::new(&frame.body);

        let tracing_id = if frame.flags.contains(FrameFlags::TRACING) {
            Some(reader.read_uuid()?)
        } else {
            None
        };
        let warnings = if frame.flags.contains(FrameFlags::WARNING) {
            reader.read_string_list()?
        } else {
            Vec::new()
        };
        if frame.flags.contains(FrameFlags::CUSTOM_PAYLOAD) {
            // A bytes map; the driver has no use for inbound payloads, but it must be
            // consumed to reach the body proper.
            let count = reader.read_u16()? as usize;
            for _ in 0..count {
                let _ = reader.read_string()?;
                let _ = reader.read_bytes_opt()?;
            }
        }

        let kind = match frame.opcode {
            Opcode::Ready => Response::Ready,
            Opcode::Authenticate => Response::Authenticate {
                authenticator: reader.read_string()?,
            },
            Opcode::Supported => Response::Supported {
                options: reader.read_string_multimap()?,
            },
            Opcode::AuthChallenge => Response::AuthChallenge {
                token: reader.read_bytes_opt()?,
            },
            Opcode::AuthSuccess => Response::AuthSuccess {
                token: reader.read_bytes_opt()?,
            },
            Opcode::Result => Response::Result(CqlResult::read(&mut reader, version)?),
            Opcode::Event => Response::Event(ServerEvent::read(&mut reader)?),
            Opcode::Error => Response::Error(read_error(&mut reader)?),
            other => {
                return Err(Error::protocol(format!(
                    "unexpected opcode in a response: {:?}",
                    other
                )))
            }
        };

        Ok(ParsedResponse {
            tracing_id,
            warnings,
            kind,
        })
    }
}

fn read_error(reader: &mut BodyReader<'_>) -> Result<ServerError> {
    let code = reader.read_i32()?;
    let message = reader.read_string()?;

    let code = match code {
        0x0000 => DbError::ServerError,
        0x000A => DbError::ProtocolError,
        0x0100 => DbError::AuthenticationError,
        0x1000 => DbError::Unavailable {
            consistency: reader.read_consistency()?,
            required: reader.read_i32()?,
            alive: reader.read_i32()?,
        },
        0x1001 => DbError::Overloaded,
        0x1002 => DbError::IsBootstrapping,
        0x1003 => DbError::TruncateError,
        0x1100 => DbError::WriteTimeout {
            consistency: reader.read_consistency()?,
            received: reader.read_i32()?,
            block_for: reader.read_i32()?,
            write_type: WriteType::parse(&reader.read_string()?),
        },
        0x1200 => DbError::ReadTimeout {
            consistency: reader.read_consistency()?,
            received: reader.read_i32()?,
            block_for: reader.read_i32()?,
            data_present: reader.read_u8()? != 0,
        },
        0x1300 => DbError::ReadFailure {
            consistency: reader.read_consistency()?,
            received: reader.read_i32()?,
            block_for: reader.read_i32()?,
            num_failures: reader.read_i32()?,
            data_present: reader.read_u8()? != 0,
        },
        0x1400 => DbError::FunctionFailure {
            keyspace: reader.read_string()?,
            function: reader.read_string()?,
            arg_types: reader.read_string_list()?,
        },
        0x1500 => DbError::WriteFailure {
            consistency: reader.read_consistency()?,
            received: reader.read_i32()?,
            block_for: reader.read_i32()?,
            num_failures: reader.read_i32()?,
            write_type: WriteType::parse(&reader.read_string()?),
        },
        0x2000 => DbError::SyntaxError,
        0x2100 => DbError::Unauthorized,
        0x2200 => DbError::Invalid,
        0x2300 => DbError::ConfigError,
        0x2400 => DbError::AlreadyExists {
            keyspace: reader.read_string()?,
            table: reader.read_string()?,
        },
        0x2500 => DbError::Unprepared {
            id: reader.read_short_bytes()?,
        },
        other => DbError::Other(other),
    };

    Ok(ServerError { code, message })
}

/// The kinds of RESULT bodies.
#[derive(Debug)]
pub(crate) enum CqlResult {
    Void,
    Rows(RawRows),
    SetKeyspace(String),
    Prepared(Prepared),
    SchemaChange(SchemaChangeEvent),
}

impl CqlResult {
    fn read(reader: &mut BodyReader<'_>, version: ProtocolVersion) -> Result<Self> {
        Ok(match reader.read_i32()? {
            0x0001 => CqlResult::Void,
            0x0002 => CqlResult::Rows(RawRows::read(reader)?),
            0x0003 => CqlResult::SetKeyspace(reader.read_string()?),
            0x0004 => CqlResult::Prepared(Prepared::read(reader, version)?),
            0x0005 => CqlResult::SchemaChange(SchemaChangeEvent::read(reader)?),
            other => {
                return Err(Error::protocol(format!(
                    "unknown result kind: 0x{:04x}",
                    other
                )))
            }
        })
    }
}

const GLOBAL_TABLES_SPEC: i32 = 0x0001;
const HAS_MORE_PAGES: i32 = 0x0002;
const NO_METADATA: i32 = 0x0004;

/// Metadata preceding the row content of a Rows result.
#[derive(Clone, Debug, Default)]
pub(crate) struct RowsMetadata {
    pub(crate) columns: Vec<ColumnSpec>,
    pub(crate) paging_state: Option<Vec<u8>>,
}

impl RowsMetadata {
    fn read(reader: &mut BodyReader<'_>) -> Result<(Self, usize)> {
        let flags = reader.read_i32()?;
        let column_count = reader.read_i32()?;
        if column_count < 0 {
            return Err(Error::protocol("negative column count"));
        }

        let paging_state = if flags & HAS_MORE_PAGES != 0 {
            reader.read_bytes_opt()?
        } else {
            None
        };

        let mut columns = Vec::new();
        if flags & NO_METADATA == 0 {
            let global_spec = if flags & GLOBAL_TABLES_SPEC != 0 {
                Some((reader.read_string()?, reader.read_string()?))
            } else {
                None
            };
            for _ in 0..column_count {
                let (keyspace, table) = match global_spec {
                    Some(ref spec) => spec.clone(),
                    None => (reader.read_string()?, reader.read_string()?),
                };
                let name = reader.read_string()?;
                let column_type = ColumnType::read(reader)?;
                columns.push(ColumnSpec {
                    keyspace,
                    table,
                    name,
                    column_type,
                });
            }
        }

        Ok((
            Self {
                columns,
                paging_state,
            },
            column_count as usize,
        ))
    }
}

/// A Rows result with undecoded cell bytes.
#[derive(Debug)]
pub(crate) struct RawRows {
    pub(crate) metadata: RowsMetadata,
    pub(crate) rows: Vec<Vec<Option<Vec<u8>>>>,
}

impl RawRows {
    fn read(reader: &mut BodyReader<'_>) -> Result<Self> {
        let (metadata, column_count) = RowsMetadata::read(reader)?;
        let row_count = reader.read_i32()?;
        if row_count < 0 {
            return Err(Error::protocol("negative row count"));
        }
        let mut rows = Vec::with_capacity(row_count as usize);
        for _ in 0..row_count {
            let mut row = Vec::with_capacity(column_count);
            for _ in 0..column_count {
                row.push(reader.read_bytes_opt()?);
            }
            rows.push(row);
        }
        Ok(Self { metadata, rows })
    }
}

/// The result of a PREPARE.
#[derive(Clone, Debug)]
pub(crate) struct Prepared {
    pub(crate) id: Vec<u8>,
    /// Indexes of the partition key columns within the bind parameters (v4+).
    pub(crate) pk_indexes: Vec<u16>,
    pub(crate) parameter_columns: Vec<ColumnSpec>,
}

impl Prepared {
    fn read(reader: &mut BodyReader<'_>, version: ProtocolVersion) -> Result<Self> {
        let id = reader.read_short_bytes()?;

        // Parameter metadata: flags, column count, (v4) pk count + indexes, col specs.
        let flags = reader.read_i32()?;
        let column_count = reader.read_i32()?;
        if column_count < 0 {
            return Err(Error::protocol("negative column count"));
        }
        let mut pk_indexes = Vec::new();
        if version >= ProtocolVersion::V4 {
            let pk_count = reader.read_i32()?;
            for _ in 0..pk_count {
                pk_indexes.push(reader.read_u16()?);
            }
        }
        let global_spec = if flags & GLOBAL_TABLES_SPEC != 0 {
            Some((reader.read_string()?, reader.read_string()?))
        } else {
            None
        };
        let mut parameter_columns = Vec::with_capacity(column_count as usize);
        for _ in 0..column_count {
            let (keyspace, table) = match global_spec {
                Some(ref spec) => spec.clone(),
                None => (reader.read_string()?, reader.read_string()?),
            };
            let name = reader.read_string()?;
            let column_type = ColumnType::read(reader)?;
            parameter_columns.push(ColumnSpec {
                keyspace,
                table,
                name,
                column_type,
            });
        }

        // The trailing result metadata is not used by the driver.
        let (_result_metadata, _) = RowsMetadata::read(reader)?;

        Ok(Self {
            id,
            pk_indexes,
            parameter_columns,
        })
    }
}

/// A column in a Rows or Prepared metadata block.
#[derive(Clone, Debug)]
pub struct ColumnSpec {
    /// The keyspace the column's table belongs to.
    pub keyspace: String,
    /// The table the column belongs to.
    pub table: String,
    /// The column name.
    pub name: String,
    /// The CQL type of the column.
    pub column_type: ColumnType,
}

/// A CQL column type as encoded in result metadata.
#[allow(missing_docs)]
#[derive(Clone, Debug, PartialEq, Eq)]
#[non_exhaustive]
pub enum ColumnType {
    Custom(String),
    Ascii,
    Bigint,
    Blob,
    Boolean,
    Counter,
    Decimal,
    Double,
    Float,
    Int,
    Timestamp,
    Uuid,
    Varchar,
    Varint,
    Timeuuid,
    Inet,
    Date,
    Time,
    Smallint,
    Tinyint,
    List(Box<ColumnType>),
    Map(Box<ColumnType>, Box<ColumnType>),
    Set(Box<ColumnType>),
    Udt {
        keyspace: String,
        name: String,
        fields: Vec<(String, ColumnType)>,
    },
    Tuple(Vec<ColumnType>),
}

impl ColumnType {
    fn read(reader: &mut BodyReader<'_>) -> Result<Self> {
        Ok(match reader.read_u16()? {
            0x0000 => ColumnType::Custom(reader.read_string()?),
            0x0001 => ColumnType::Ascii,
            0x0002 => ColumnType::Bigint,
            0x0003 => ColumnType::Blob,
            0x0004 => ColumnType::Boolean,
            0x0005 => ColumnType::Counter,
            0x0006 => ColumnType::Decimal,
            0x0007 => ColumnType::Double,
            0x0008 => ColumnType::Float,
            0x0009 => ColumnType::Int,
            0x000B => ColumnType::Timestamp,
            0x000C => ColumnType::Uuid,
            0x000D => ColumnType::Varchar,
            0x000E => ColumnType::Varint,
            0x000F => ColumnType::Timeuuid,
            0x0010 => ColumnType::Inet,
            0x0011 => ColumnType::Date,
            0x0012 => ColumnType::Time,
            0x0013 => ColumnType::Smallint,
            0x0014 => ColumnType::Tinyint,
            0x0020 => ColumnType::List(Box::new(ColumnType::read(reader)?)),
            0x0021 => ColumnType::Map(
                Box::new(ColumnType::read(reader)?),
                Box::new(ColumnType::read(reader)?),
            ),
            0x0022 => ColumnType::Set(Box::new(ColumnType::read(reader)?)),
            0x0030 => {
                let keyspace = reader.read_string()?;
                let name = reader.read_string()?;
                let field_count = reader.read_u16()? as usize;
                let mut fields = Vec::with_capacity(field_count);
                for _ in 0..field_count {
                    let field_name = reader.read_string()?;
                    let field_type = ColumnType::read(reader)?;
                    fields.push((field_name, field_type));
                }
                ColumnType::Udt {
                    keyspace,
                    name,
                    fields,
                }
            }
            0x0031 => {
                let count = reader.read_u16()? as usize;
                let mut types = Vec::with_capacity(count);
                for _ in 0..count {
                    types.push(ColumnType::read(reader)?);
                }
                ColumnType::Tuple(types)
            }
            other => {
                return Err(Error::protocol(format!(
                    "unknown column type code: 0x{:04x}",
                    other
                )))
            }
        })
    }
}

/// A server push notification delivered on stream id -1.
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) enum ServerEvent {
    TopologyChange {
        change_type: TopologyChangeType,
        address: SocketAddr,
    },
    StatusChange {
        change_type: StatusChangeType,
        address: SocketAddr,
    },
    SchemaChange(SchemaChangeEvent),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum TopologyChangeType {
    NewNode,
    RemovedNode,
    MovedNode,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum StatusChangeType {
    Up,
    Down,
}

/// A schema change, delivered both as an EVENT and as a RESULT kind.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SchemaChangeEvent {
    /// `CREATED`, `UPDATED` or `DROPPED`.
    pub change_type: String,
    /// `KEYSPACE`, `TABLE`, `TYPE`, `FUNCTION` or `AGGREGATE`.
    pub target: String,
    /// The affected keyspace.
    pub keyspace: String,
    /// The affected object inside the keyspace, when the target is not a keyspace.
    pub object: Option<String>,
    /// Argument types, for function and aggregate targets.
    pub arguments: Vec<String>,
}

impl SchemaChangeEvent {
    fn read(reader: &mut BodyReader<'_>) -> Result<Self> {
        let change_type = reader.read_string()?;
        let target = reader.read_string()?;
        let keyspace = reader.read_string()?;
        let (object, arguments) = match target.as_str() {
            "KEYSPACE" => (None, Vec::new()),
            "TABLE" | "TYPE" => (Some(reader.read_string()?), Vec::new()),
            "FUNCTION" | "AGGREGATE" => {
                (Some(reader.read_string()?), reader.read_string_list()?)
            }
            _ => (None, Vec::new()),
        };
        Ok(Self {
            change_type,
            target,
            keyspace,
            object,
            arguments,
        })
    }
}

impl ServerEvent {
    fn read(reader: &mut BodyReader<'_>) -> Result<Self> {
        let event_type = reader.read_string()?;
        Ok(match event_type.as_str() {
            "TOPOLOGY_CHANGE" => {
                let change = reader.read_string()?;
                let change_type = match change.as_str() {
                    "NEW_NODE" => TopologyChangeType::NewNode,
                    "REMOVED_NODE" => TopologyChangeType::RemovedNode,
                    "MOVED_NODE" => TopologyChangeType::MovedNode,
                    other => {
                        return Err(Error::protocol(format!(
                            "unknown topology change type: {}",
                            other
                        )))
                    }
                };
                ServerEvent::TopologyChange {
                    change_type,
                    address: reader.read_inet()?,
                }
            }
            "STATUS_CHANGE" => {
                let change = reader.read_string()?;
                let change_type = match change.as_str() {
                    "UP" => StatusChangeType::Up,
                    "DOWN" => StatusChangeType::Down,
                    other => {
                        return Err(Error::protocol(format!(
                            "unknown status change type: {}",
                            other
                        )))
                    }
                };
                ServerEvent::StatusChange {
                    change_type,
                    address: reader.read_inet()?,
                }
            }
            "SCHEMA_CHANGE" => ServerEvent::SchemaChange(SchemaChangeEvent::read(reader)?),
            other => {
                return Err(Error::protocol(format!("unknown event type: {}", other)))
            }
        })
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::frame::codec;
    use pretty_assertions::assert_eq;

    fn frame(opcode: Opcode, body: Vec<u8>) -> Frame {
        Frame::new(1, opcode, body)
    }

    #[test]
    fn parses_read_timeout_error_payload() {
        let mut body = Vec::new();
        codec::write_i32(&mut body, 0x1200);
        codec::write_string(&mut body, "Operation timed out");
        codec::write_consistency(&mut body, crate::options::Consistency::Quorum);
        codec::write_i32(&mut body, 1);
        codec::write_i32(&mut body, 2);
        codec::write_u8(&mut body, 0);

        let parsed =
            Response::deserialize(&frame(Opcode::Error, body), ProtocolVersion::V4).unwrap();
        match parsed.kind {
            Response::Error(e) => {
                assert_eq!(
                    e.code,
                    DbError::ReadTimeout {
                        consistency: crate::options::Consistency::Quorum,
                        received: 1,
                        block_for: 2,
                        data_present: false,
                    }
                );
                assert_eq!(e.message, "Operation timed out");
            }
            other => panic!("expected an error response, got {:?}", other),
        }
    }

    #[test]
    fn parses_status_change_event() {
        let mut body = Vec::new();
        codec::write_string(&mut body, "STATUS_CHANGE");
        codec::write_string(&mut body, "DOWN");
        body.push(4);
        body.extend_from_slice(&[10, 0, 0, 2]);
        codec::write_i32(&mut body, 9042);

        let parsed =
            Response::deserialize(&frame(Opcode::Event, body), ProtocolVersion::V4).unwrap();
        match parsed.kind {
            Response::Event(ServerEvent::StatusChange {
                change_type,
                address,
            }) => {
                assert_eq!(change_type, StatusChangeType::Down);
                assert_eq!(address, "10.0.0.2:9042".parse().unwrap());
            }
            other => panic!("expected a status change, got {:?}", other),
        }
    }

    #[test]
    fn parses_rows_with_global_table_spec() {
        let mut body = Vec::new();
        codec::write_i32(&mut body, 0x0002); // Rows
        codec::write_i32(&mut body, GLOBAL_TABLES_SPEC);
        codec::write_i32(&mut body, 2); // columns
        codec::write_string(&mut body, "system");
        codec::write_string(&mut body, "local");
        codec::write_string(&mut body, "data_center");
        codec::write_u16(&mut body, 0x000D); // varchar
        codec::write_string(&mut body, "tokens");
        codec::write_u16(&mut body, 0x0022); // set<
        codec::write_u16(&mut body, 0x000D); //   varchar>
        codec::write_i32(&mut body, 1); // rows
        codec::write_bytes_opt(&mut body, Some(b"dc1"));
        codec::write_bytes_opt(&mut body, None);

        let parsed =
            Response::deserialize(&frame(Opcode::Result, body), ProtocolVersion::V4).unwrap();
        match parsed.kind {
            Response::Result(CqlResult::Rows(rows)) => {
                assert_eq!(rows.metadata.columns.len(), 2);
                assert_eq!(rows.metadata.columns[0].name, "data_center");
                assert_eq!(
                    rows.metadata.columns[1].column_type,
                    ColumnType::Set(Box::new(ColumnType::Varchar))
                );
                assert_eq!(rows.rows, vec![vec![Some(b"dc1".to_vec()), None]]);
            }
            other => panic!("expected rows, got {:?}", other),
        }
    }

    #[test]
    fn tracing_flag_consumes_leading_uuid() {
        let id = Uuid::new_v4();
        let mut body = Vec::new();
        body.extend_from_slice(id.as_bytes());
        let mut f = frame(Opcode::Ready, body);
        f.flags |= FrameFlags::TRACING;
        let parsed = Response::deserialize(&f, ProtocolVersion::V4).unwrap();
        assert_eq!(parsed.tracing_id, Some(id));
        assert!(matches!(parsed.kind, Response::Ready));
    }
}
