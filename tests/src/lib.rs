//! Integration tests that drive the client core against a mock HTTP server.
