//! Structured payloads carried in JSON-encoded message blocks.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

/// Handshake key for the high-level protocol version
pub const HANDSHAKE_KEY_PROTOCOL_VERSION: &str = "protocolVersion";
/// Handshake key for the sender's node id
pub const HANDSHAKE_KEY_NODE_ID: &str = "nodeId";
/// Protocol version offered in handshakes
pub const PROTOCOL_VERSION: &str = "1.0";

/// Handshake data: a flat string map
pub type HandshakeData = BTreeMap<String, String>;

/// A tool published by a client
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolDescriptor {
    /// Tool identifier
    pub tool_id: String,
    /// Tool version
    pub tool_version: String,
    /// Groups allowed to use the tool
    pub authorization_group_ids: BTreeSet<String>,
    /// Hash over the tool description, if available
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_data_hash: Option<String>,
    /// Serialized component description, if available
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub serialized_component_description: Option<String>,
}

impl ToolDescriptor {
    /// Create a descriptor without hash or description
    pub fn new(
        tool_id: impl Into<String>,
        tool_version: impl Into<String>,
        authorization_group_ids: BTreeSet<String>,
    ) -> Self {
        Self {
            tool_id: tool_id.into(),
            tool_version: tool_version.into(),
            authorization_group_ids,
            tool_data_hash: None,
            serialized_component_description: None,
        }
    }
}

/// Full replacement of the tools announced for one destination
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolDescriptorListUpdate {
    /// Destination the tools are reachable at
    pub destination_id: String,
    /// Human-readable destination name
    pub display_name: String,
    /// Announced tools
    pub tool_descriptors: Vec<ToolDescriptor>,
}

impl ToolDescriptorListUpdate {
    /// Create a new list update
    pub fn new(
        destination_id: impl Into<String>,
        display_name: impl Into<String>,
        tool_descriptors: Vec<ToolDescriptor>,
    ) -> Self {
        Self {
            destination_id: destination_id.into(),
            display_name: display_name.into(),
            tool_descriptors,
        }
    }
}

/// Purpose of a logical channel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ChannelType {
    /// Runs one tool execution
    ToolExecution,
    /// Fetches one documentation archive
    DocumentationRequest,
}

/// Request to open a logical channel to a destination
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChannelCreationRequest {
    /// Channel purpose
    pub channel_type: ChannelType,
    /// Destination the channel leads to
    pub destination_id: String,
    /// Channel id, assigned by the relay once known
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channel_id: Option<u64>,
    /// Correlation id chosen by the requester
    pub request_id: String,
}

impl ChannelCreationRequest {
    /// Create a request without an assigned channel id
    pub fn new(
        channel_type: ChannelType,
        destination_id: impl Into<String>,
        request_id: impl Into<String>,
    ) -> Self {
        Self {
            channel_type,
            destination_id: destination_id.into(),
            channel_id: None,
            request_id: request_id.into(),
        }
    }
}

/// Answer to a channel creation request
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChannelCreationResponse {
    /// Assigned channel id
    pub channel_id: u64,
    /// Correlation id of the request
    pub request_id: String,
    /// Whether the channel was created
    pub success: bool,
}

/// Tool execution request
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolExecutionRequest {
    /// Tool identifier
    pub tool_id: String,
    /// Tool version
    pub tool_version: String,
    /// Group under which the tool is used
    pub authorization_group_id: String,
    /// Destination executing the tool
    pub destination_id: String,
    /// Inputs not required by the tool
    #[serde(default)]
    pub non_required_inputs: BTreeSet<String>,
    /// Tool properties
    #[serde(default)]
    pub properties: BTreeMap<String, String>,
}

/// Acceptance or rejection of an execution request
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolExecutionRequestResponse {
    /// Whether the execution was accepted
    pub accepted: bool,
    /// Reason for a rejection
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
}

/// One execution output event
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolExecutionEvent {
    /// Event kind, such as stdout or stderr
    pub event_type: String,
    /// Event data
    pub data: String,
}

impl ToolExecutionEvent {
    /// Create a new event
    pub fn new(event_type: impl Into<String>, data: impl Into<String>) -> Self {
        Self {
            event_type: event_type.into(),
            data: data.into(),
        }
    }
}

/// Final outcome of an execution
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolExecutionResult {
    /// Whether the tool finished successfully
    pub successful: bool,
    /// Whether the execution was cancelled
    pub cancelled: bool,
}

/// Start marker of a file transfer section
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileTransferSectionInfo {
    /// Section name; `None` for an unnamed section
    #[serde(default)]
    pub name: Option<String>,
}

impl FileTransferSectionInfo {
    /// Create a section marker
    pub fn new(name: Option<String>) -> Self {
        Self { name }
    }
}

/// Kind of a transferred file system entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FileEntryType {
    /// Regular file; content blocks follow
    File,
    /// Directory; no content follows
    Directory,
}

/// Header preceding the content blocks of one file
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileHeader {
    /// Entry kind
    #[serde(rename = "type")]
    pub entry_type: FileEntryType,
    /// Relative path inside the section
    pub path: String,
    /// Content size in bytes
    pub size: u64,
}

impl FileHeader {
    /// Create a header for a regular file
    pub fn file(path: impl Into<String>, size: u64) -> Self {
        Self {
            entry_type: FileEntryType::File,
            path: path.into(),
            size,
        }
    }

    /// Create a header for a directory
    pub fn directory(path: impl Into<String>) -> Self {
        Self {
            entry_type: FileEntryType::Directory,
            path: path.into(),
            size: 0,
        }
    }
}

/// Request for a documentation archive
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolDocumentationRequest {
    /// Reference of the requested documentation
    pub reference_id: String,
}

impl ToolDocumentationRequest {
    /// Create a new request
    pub fn new(reference_id: impl Into<String>) -> Self {
        Self {
            reference_id: reference_id.into(),
        }
    }
}

/// Announces availability and size of a documentation archive
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolDocumentationResponse {
    /// Reference of the requested documentation
    pub reference_id: String,
    /// Whether the documentation exists
    pub available: bool,
    /// Archive size; content blocks follow when available
    pub size: u64,
}
