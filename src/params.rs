// Copyright 2022 jmjoy
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! FastCGI request parameters.
//!
//! The web server transmits CGI meta-variables (`REQUEST_METHOD`,
//! `QUERY_STRING`, ...) over the `PARAMS` stream as a name/value block.
//! This module holds the parsed form handed to the application handler.

use crate::{error::ServerResult, meta};
use bytes::Bytes;
use std::{
    borrow::Cow,
    collections::{HashMap, hash_map},
};

/// Parameters of a FastCGI request.
///
/// Names are treated as text by convention; values are kept as the raw
/// bytes the web server sent. A name sent more than once keeps its last
/// value.
#[derive(Default, Debug, Clone)]
pub struct Params(HashMap<String, Bytes>);

impl Params {
    /// Parses a complete accumulated `PARAMS` stream.
    ///
    /// # Arguments
    ///
    /// * `buf` - The concatenated content of all `PARAMS` records
    pub(crate) fn parse(buf: &Bytes) -> ServerResult<Self> {
        let mut map = HashMap::new();
        for (name, value) in meta::decode_name_value_pairs(buf)? {
            map.insert(String::from_utf8_lossy(&name).into_owned(), value);
        }
        Ok(Self(map))
    }

    /// Returns the raw value of a parameter.
    ///
    /// # Arguments
    ///
    /// * `name` - The parameter name
    pub fn get(&self, name: &str) -> Option<&Bytes> {
        self.0.get(name)
    }

    /// Returns the value of a parameter as text, replacing invalid UTF-8.
    ///
    /// # Arguments
    ///
    /// * `name` - The parameter name
    pub fn get_str(&self, name: &str) -> Option<Cow<'_, str>> {
        self.0.get(name).map(|value| String::from_utf8_lossy(value))
    }

    /// Returns the number of parameters.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Returns `true` if no parameters were sent.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Iterates over the parameters in arbitrary order.
    pub fn iter(&self) -> hash_map::Iter<'_, String, Bytes> {
        self.0.iter()
    }
}

impl<'a> IntoIterator for &'a Params {
    type Item = (&'a String, &'a Bytes);
    type IntoIter = hash_map::Iter<'a, String, Bytes>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}
