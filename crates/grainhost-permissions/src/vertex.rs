//! Vertices of the sharing graph
//!
//! Permissions always belong to a `(grain, vertex)` pair. A grant is an edge
//! from its sharer vertex to its recipient vertex.

use grainhost_core::{ApiToken, GrainId, GrainhostError, IdentityId, Result, TokenId, TokenOwner};
use std::fmt;

/// A principal in the sharing graph
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Vertex {
    /// The grain owner's account, source of every permission
    Owner,
    /// A logged-in identity
    Identity(IdentityId),
    /// A visitor with no identity
    Anonymous,
    /// A bearer grant not bound to an identity
    Token(TokenId),
}

impl Vertex {
    /// Source of the edge a grant represents: its parent grant when chained,
    /// otherwise the issuing identity.
    pub fn sharer_of(token: &ApiToken) -> Result<Vertex> {
        if let Some(parent) = &token.parent_token {
            Ok(Vertex::Token(parent.clone()))
        } else if let Some(identity_id) = &token.identity_id {
            Ok(Vertex::Identity(identity_id.clone()))
        } else {
            Err(GrainhostError::invalid(format!(
                "token {} has neither a parent token nor an issuing identity",
                token.id
            )))
        }
    }

    /// Destination of the edge a grant represents
    pub fn recipient_of(token: &ApiToken) -> Vertex {
        match &token.owner {
            TokenOwner::User(user) => Vertex::Identity(user.identity_id.clone()),
            TokenOwner::Webkey | TokenOwner::Grain(_) | TokenOwner::Frontend => {
                Vertex::Token(token.id.clone())
            }
        }
    }
}

impl fmt::Display for Vertex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Vertex::Owner => f.write_str("o:Owner"),
            Vertex::Identity(id) => write!(f, "i:{id}"),
            Vertex::Anonymous => f.write_str("i:anonymous"),
            Vertex::Token(id) => write!(f, "t:{id}"),
        }
    }
}

/// Who is asking for access to which grain
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Principal {
    /// Holder of a bearer grant
    Token {
        /// Grant id
        token_id: TokenId,
        /// Grain the grant applies to
        grain_id: GrainId,
    },
    /// A user, or an anonymous visitor when `identity_id` is `None`
    Identity {
        /// Grain being opened
        grain_id: GrainId,
        /// Acting identity
        identity_id: Option<IdentityId>,
    },
}

impl Principal {
    /// Holder of `token`
    pub fn token(token: &ApiToken) -> Self {
        Principal::Token {
            token_id: token.id.clone(),
            grain_id: token.grain_id.clone(),
        }
    }

    /// `identity_id` acting on `grain_id`
    pub fn identity(grain_id: GrainId, identity_id: IdentityId) -> Self {
        Principal::Identity {
            grain_id,
            identity_id: Some(identity_id),
        }
    }

    /// Anonymous visitor of `grain_id`
    pub fn anonymous(grain_id: GrainId) -> Self {
        Principal::Identity {
            grain_id,
            identity_id: None,
        }
    }

    /// Grain being accessed
    pub fn grain_id(&self) -> &GrainId {
        match self {
            Principal::Token { grain_id, .. } | Principal::Identity { grain_id, .. } => grain_id,
        }
    }

    /// Vertex whose permissions answer the query
    pub fn vertex(&self) -> Vertex {
        match self {
            Principal::Token { token_id, .. } => Vertex::Token(token_id.clone()),
            Principal::Identity {
                identity_id: Some(identity_id),
                ..
            } => Vertex::Identity(identity_id.clone()),
            Principal::Identity {
                identity_id: None, ..
            } => Vertex::Anonymous,
        }
    }
}
