use crate::graph::{Graph, PortRef};
use crate::ConnectionRejection;

/// Direction a port name resolves to on its node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PortSide {
    Input,
    Output,
}

/// Accepts or rejects proposed edges before they enter a graph.
pub struct ConnectionValidator;

impl ConnectionValidator {
    /// Check a proposed edge against `graph`.
    ///
    /// Rules are applied in order: no self connection, exactly one output
    /// and one input endpoint, no duplicate of an existing edge. On success
    /// the endpoints are returned normalised to `(output, input)`.
    pub fn validate(
        from: &PortRef,
        to: &PortRef,
        graph: &Graph,
    ) -> Result<(PortRef, PortRef), ConnectionRejection> {
        if from.node_id == to.node_id {
            return Err(ConnectionRejection::SelfConnection { node: from.node_id });
        }

        let from_side = Self::side(from, graph)?;
        let to_side = Self::side(to, graph)?;
        let (from, to) = match (from_side, to_side) {
            (PortSide::Output, PortSide::Input) => (from.clone(), to.clone()),
            (PortSide::Input, PortSide::Output) => (to.clone(), from.clone()),
            _ => {
                return Err(ConnectionRejection::PortDirection {
                    from: from.clone(),
                    to: to.clone(),
                })
            }
        };

        if graph.connections().any(|c| c.from == from && c.to == to) {
            return Err(ConnectionRejection::Duplicate { from, to });
        }

        Ok((from, to))
    }

    fn side(port: &PortRef, graph: &Graph) -> Result<PortSide, ConnectionRejection> {
        let unknown = || ConnectionRejection::UnknownPort {
            node: port.node_id,
            port: port.port.clone(),
        };
        let node = graph.node(port.node_id).ok_or_else(unknown)?;
        let ty = graph.node_type_of(node).map_err(|_| unknown())?;

        if ty.has_active_output(&port.port, &node.properties) {
            Ok(PortSide::Output)
        } else if ty.has_input(&port.port) {
            Ok(PortSide::Input)
        } else {
            Err(unknown())
        }
    }
}
