//! Message type numbers carried in the `msgType` field of every datagram.

// Broker control (recipient count 0)
pub const CONTROL_SET_CHANNEL: u16 = 9000;
pub const CONTROL_REMOVE_CHANNEL: u16 = 9001;
pub const CONTROL_ADD_POST_REMOVE: u16 = 9010;

// State server
pub const STATESERVER_OBJECT_GENERATE_WITH_REQUIRED: u16 = 2001;
pub const STATESERVER_OBJECT_GENERATE_WITH_REQUIRED_OTHER: u16 = 2003;
pub const STATESERVER_OBJECT_UPDATE_FIELD: u16 = 2004;
pub const STATESERVER_OBJECT_DELETE_RAM: u16 = 2007;
pub const STATESERVER_OBJECT_SET_ZONE: u16 = 2008;
pub const STATESERVER_OBJECT_CHANGE_ZONE: u16 = 2009;
pub const STATESERVER_OBJECT_LEAVING_AI_INTEREST: u16 = 2033;
pub const STATESERVER_ADD_AI_RECV: u16 = 2045;
pub const STATESERVER_SHARD_REST: u16 = 2061;
pub const STATESERVER_OBJECT_ENTER_AI_RECV: u16 = 2067;

// Client agent
pub const CLIENT_AGENT_SET_INTEREST: u16 = 3010;
pub const CLIENT_AGENT_REMOVE_INTEREST: u16 = 3011;

// Database server
pub const DBSERVER_CREATE_STORED_OBJECT: u16 = 1003;
pub const DBSERVER_CREATE_STORED_OBJECT_RESP: u16 = 1004;
pub const DBSERVER_DELETE_STORED_OBJECT: u16 = 1008;
pub const DBSERVER_GET_STORED_VALUES: u16 = 1012;
pub const DBSERVER_GET_STORED_VALUES_RESP: u16 = 1013;
pub const DBSERVER_SET_STORED_VALUES: u16 = 1014;
pub const DBSERVER_SET_STORED_VALUES_RESP: u16 = 1015;
pub const DBSERVER_ACCOUNT_QUERY: u16 = 1020;
pub const DBSERVER_ACCOUNT_QUERY_RESP: u16 = 1021;
pub const DBSERVER_WISHNAME_CLEAR: u16 = 1024;

/// Human-readable name for log lines.
pub fn name(msg_type: u16) -> &'static str {
    match msg_type {
        CONTROL_SET_CHANNEL => "CONTROL_SET_CHANNEL",
        CONTROL_REMOVE_CHANNEL => "CONTROL_REMOVE_CHANNEL",
        CONTROL_ADD_POST_REMOVE => "CONTROL_ADD_POST_REMOVE",
        STATESERVER_OBJECT_GENERATE_WITH_REQUIRED => "STATESERVER_OBJECT_GENERATE_WITH_REQUIRED",
        STATESERVER_OBJECT_GENERATE_WITH_REQUIRED_OTHER => {
            "STATESERVER_OBJECT_GENERATE_WITH_REQUIRED_OTHER"
        }
        STATESERVER_OBJECT_UPDATE_FIELD => "STATESERVER_OBJECT_UPDATE_FIELD",
        STATESERVER_OBJECT_DELETE_RAM => "STATESERVER_OBJECT_DELETE_RAM",
        STATESERVER_OBJECT_SET_ZONE => "STATESERVER_OBJECT_SET_ZONE",
        STATESERVER_OBJECT_CHANGE_ZONE => "STATESERVER_OBJECT_CHANGE_ZONE",
        STATESERVER_OBJECT_LEAVING_AI_INTEREST => "STATESERVER_OBJECT_LEAVING_AI_INTEREST",
        STATESERVER_ADD_AI_RECV => "STATESERVER_ADD_AI_RECV",
        STATESERVER_SHARD_REST => "STATESERVER_SHARD_REST",
        STATESERVER_OBJECT_ENTER_AI_RECV => "STATESERVER_OBJECT_ENTER_AI_RECV",
        CLIENT_AGENT_SET_INTEREST => "CLIENT_AGENT_SET_INTEREST",
        CLIENT_AGENT_REMOVE_INTEREST => "CLIENT_AGENT_REMOVE_INTEREST",
        DBSERVER_CREATE_STORED_OBJECT => "DBSERVER_CREATE_STORED_OBJECT",
        DBSERVER_CREATE_STORED_OBJECT_RESP => "DBSERVER_CREATE_STORED_OBJECT_RESP",
        DBSERVER_DELETE_STORED_OBJECT => "DBSERVER_DELETE_STORED_OBJECT",
        DBSERVER_GET_STORED_VALUES => "DBSERVER_GET_STORED_VALUES",
        DBSERVER_GET_STORED_VALUES_RESP => "DBSERVER_GET_STORED_VALUES_RESP",
        DBSERVER_SET_STORED_VALUES => "DBSERVER_SET_STORED_VALUES",
        DBSERVER_SET_STORED_VALUES_RESP => "DBSERVER_SET_STORED_VALUES_RESP",
        DBSERVER_ACCOUNT_QUERY => "DBSERVER_ACCOUNT_QUERY",
        DBSERVER_ACCOUNT_QUERY_RESP => "DBSERVER_ACCOUNT_QUERY_RESP",
        DBSERVER_WISHNAME_CLEAR => "DBSERVER_WISHNAME_CLEAR",
        _ => "UNKNOWN",
    }
}
